//! # Navigation Whitelist
//!
//! Optional allow-set of domain suffixes. The server owns the list's
//! lifecycle — fetch from the configured source, cache on disk under the
//! platform user-data root, refresh once per calendar day, push updates
//! to the extension — while the extension does the actual blocking of
//! top-level navigations.
//!
//! With no source configured the whitelist is disabled and every host is
//! allowed. Whitelist state is independent of the connection state
//! machine: it survives disable/enable cycles.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};

/// Environment variable naming the remote whitelist source.
pub const WHITELIST_URL_ENV: &str = "BRIDGE_WHITELIST_URL";

/// On-disk cache shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedList {
    fetched_on: NaiveDate,
    suffixes: Vec<String>,
}

pub struct Whitelist {
    cache_path: PathBuf,
    source_url: Option<String>,
    state: RwLock<Option<CachedList>>,
}

impl Whitelist {
    pub fn new(cache_path: PathBuf, source_url: Option<String>) -> Self {
        Self {
            cache_path,
            source_url,
            state: RwLock::new(None),
        }
    }

    /// Cache file under the platform user-data root.
    pub fn default_cache_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bridge-server")
            .join("whitelist.json")
    }

    pub fn is_configured(&self) -> bool {
        self.source_url.is_some()
    }

    /// Loads the on-disk cache, if any. Invoked once at startup; a
    /// corrupt cache is discarded and refetched on the next refresh.
    pub async fn load_cache(&self) {
        let raw = match std::fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<CachedList>(&raw) {
            Ok(cached) => {
                info!(
                    suffixes = cached.suffixes.len(),
                    "Loaded whitelist cache from {}",
                    self.cache_path.display()
                );
                *self.state.write().await = Some(cached);
            }
            Err(e) => warn!("Discarding corrupt whitelist cache: {}", e),
        }
    }

    /// True when the list has never been fetched or is from a previous
    /// calendar day.
    pub async fn needs_refresh(&self, today: NaiveDate) -> bool {
        if self.source_url.is_none() {
            return false;
        }
        match self.state.read().await.as_ref() {
            Some(cached) => cached.fetched_on < today,
            None => true,
        }
    }

    /// Fetches the list if it is due, persisting the cache. Returns the
    /// fresh suffixes when an update happened, so the caller can push
    /// them to the extension.
    pub async fn refresh_if_due(&self, client: &reqwest::Client) -> Result<Option<Vec<String>>> {
        let today = chrono::Local::now().date_naive();
        if !self.needs_refresh(today).await {
            return Ok(None);
        }
        let url = match &self.source_url {
            Some(url) => url.clone(),
            None => return Ok(None),
        };

        let body = client
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::Io(format!("whitelist fetch: {}", e)))?
            .text()
            .await
            .map_err(|e| BridgeError::Io(format!("whitelist fetch: {}", e)))?;

        let suffixes = parse_body(&body);
        info!(suffixes = suffixes.len(), "Fetched whitelist from {}", url);

        let cached = CachedList {
            fetched_on: today,
            suffixes: suffixes.clone(),
        };
        if let Err(e) = persist(&self.cache_path, &cached) {
            warn!("Failed to persist whitelist cache: {}", e);
        }
        *self.state.write().await = Some(cached);
        Ok(Some(suffixes))
    }

    /// Current suffixes, for pushing to a freshly connected extension.
    /// Suffix matching itself happens extension-side, against this set.
    pub async fn suffixes(&self) -> Option<Vec<String>> {
        self.state.read().await.as_ref().map(|c| c.suffixes.clone())
    }
}

/// Accepts either a JSON string array or newline-separated entries with
/// `#` comments.
fn parse_body(body: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(body) {
        return list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn persist(path: &Path, cached: &CachedList) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(cached)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn unconfigured_whitelist_never_refreshes_or_pushes() {
        let wl = Whitelist::new(PathBuf::from("/nonexistent"), None);
        assert!(!wl.is_configured());
        assert!(wl.suffixes().await.is_none());
        assert!(!wl.needs_refresh(date("2026-08-01")).await);
    }

    #[tokio::test]
    async fn refresh_is_due_daily() {
        let wl = Whitelist::new(PathBuf::from("/nonexistent"), Some("http://x".into()));
        assert!(wl.needs_refresh(date("2026-08-01")).await);
        *wl.state.write().await = Some(CachedList {
            fetched_on: date("2026-08-01"),
            suffixes: vec![],
        });
        assert!(!wl.needs_refresh(date("2026-08-01")).await);
        assert!(wl.needs_refresh(date("2026-08-02")).await);
    }

    #[tokio::test]
    async fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-server").join("whitelist.json");
        let cached = CachedList {
            fetched_on: date("2026-08-01"),
            suffixes: vec!["example.com".into()],
        };
        persist(&path, &cached).unwrap();

        let wl = Whitelist::new(path, Some("http://x".into()));
        wl.load_cache().await;
        assert_eq!(wl.suffixes().await, Some(vec!["example.com".to_string()]));
        assert!(!wl.needs_refresh(date("2026-08-01")).await);
    }

    #[test]
    fn body_parses_json_or_lines() {
        assert_eq!(
            parse_body(r#"["a.com", "b.org"]"#),
            vec!["a.com".to_string(), "b.org".to_string()]
        );
        assert_eq!(
            parse_body("# comment\na.com\n\nb.org\n"),
            vec!["a.com".to_string(), "b.org".to_string()]
        );
    }
}
