//! # Session Registry & Tab Ownership
//!
//! Holds the logical client identities sharing one Connection, including:
//! - **Session registry**: maps client ids to their session state
//! - **Tab ownership**: which session owns which browser tab
//! - **Attached tab**: the default target of tab-scoped tools, per session
//!
//! Registries use [`DashMap`] for concurrent access from the agent loop,
//! the transport event loop, and (on a leader) follower handlers. Entries
//! are only held for synchronous mutation, never across await points.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_protocol::TabInfo;
use dashmap::DashMap;

use crate::error::{BridgeError, Result};
use crate::experiments::{Experiment, ExperimentRegistry};
use crate::humanize::MouseSession;

/// State for one logical client within the Connection.
pub struct Session {
    /// Stable identifier supplied at enable time.
    pub client_id: String,
    /// Tabs this session owns. A tab belongs to at most one session.
    pub tabs: HashSet<i64>,
    /// Latest attached-tab snapshot pushed by the extension.
    pub attached_tab: Option<TabInfo>,
    /// Extension-side tab ids are stale after an extension reconnect;
    /// ownership is still honored logically.
    pub tabs_stale: bool,
    /// Per-session experiment overrides on top of the Connection flags.
    pub overrides: HashMap<Experiment, bool>,
    /// Humanization state; present while the mouse humanization
    /// experiment is effective for this session.
    pub mouse: Option<MouseSession>,
    /// Previous page-state capture, for the page-diff tool.
    pub last_page_state: Option<serde_json::Value>,
    /// Last tool activity, for the idle-drift cadence.
    pub last_activity: Instant,
}

impl Session {
    fn new(client_id: String, overrides: HashMap<Experiment, bool>) -> Self {
        Self {
            client_id,
            tabs: HashSet::new(),
            attached_tab: None,
            tabs_stale: false,
            overrides,
            mouse: None,
            last_page_state: None,
            last_activity: Instant::now(),
        }
    }
}

/// Registry of live sessions, keyed by client id.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Creates a session for an enabling agent. A duplicate identifier is
    /// rejected without disturbing the existing session.
    pub fn create(&self, client_id: &str, overrides: HashMap<Experiment, bool>) -> Result<()> {
        if self.sessions.contains_key(client_id) {
            return Err(BridgeError::DuplicateSession(client_id.to_string()));
        }
        self.sessions
            .insert(client_id.to_string(), Session::new(client_id.to_string(), overrides));
        Ok(())
    }

    /// Registers a follower's agent as an additional session on a leader.
    pub fn create_follower(&self, client_id: &str) -> Result<()> {
        if self.sessions.contains_key(client_id) {
            return Err(BridgeError::AlreadyRegistered(client_id.to_string()));
        }
        self.sessions
            .insert(client_id.to_string(), Session::new(client_id.to_string(), HashMap::new()));
        Ok(())
    }

    /// Destroys a session. Its tabs are left open in the browser; only
    /// the ownership mapping is cleared.
    pub fn remove(&self, client_id: &str) -> bool {
        self.sessions.remove(client_id).is_some()
    }

    /// Destroys every session. Called on `disable`.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    // ─── Tab Ownership ──────────────────────────────────────────

    /// Records `tab` as owned by `client_id`. Tabs created through a
    /// session's tools are assigned here implicitly.
    pub fn assign_tab(&self, client_id: &str, tab: i64) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.tabs.insert(tab);
        }
    }

    pub fn release_tab(&self, client_id: &str, tab: i64) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.tabs.remove(&tab);
            if session
                .attached_tab
                .as_ref()
                .is_some_and(|t| t.id == tab)
            {
                session.attached_tab = None;
            }
        }
    }

    /// The session owning `tab`, if any.
    pub fn owner_of(&self, tab: i64) -> Option<String> {
        self.sessions
            .iter()
            .find(|entry| entry.tabs.contains(&tab))
            .map(|entry| entry.key().clone())
    }

    /// ACL check for an explicit tab argument.
    pub fn check_owns(&self, client_id: &str, tab: i64) -> Result<()> {
        let owned = self
            .sessions
            .get(client_id)
            .map(|s| s.tabs.contains(&tab))
            .unwrap_or(false);
        if owned {
            Ok(())
        } else {
            Err(BridgeError::PermissionDenied(format!(
                "session \"{}\" does not own tab {}",
                client_id, tab
            )))
        }
    }

    /// Resolves the tab a tab-scoped tool acts on: the explicit argument
    /// (ownership-checked) or the session's attached tab. A tab the
    /// session does not own is denied outright; ownership of
    /// pre-existing tabs is only ever granted through the extension's
    /// attached-tab pushes.
    pub fn resolve_tab(&self, client_id: &str, explicit: Option<i64>) -> Result<i64> {
        match explicit {
            Some(tab) => {
                self.check_owns(client_id, tab)?;
                Ok(tab)
            }
            None => self
                .sessions
                .get(client_id)
                .and_then(|s| s.attached_tab.as_ref().map(|t| t.id))
                .ok_or_else(|| {
                    BridgeError::InvalidArguments(format!(
                        "session \"{}\" has no attached tab; pass tab_id or select a tab first",
                        client_id
                    ))
                }),
        }
    }

    /// Filters a list-style result down to tabs the session owns.
    pub fn filter_owned(&self, client_id: &str, tabs: Vec<TabInfo>) -> Vec<TabInfo> {
        let Some(session) = self.sessions.get(client_id) else {
            return Vec::new();
        };
        tabs.into_iter()
            .filter(|t| session.tabs.contains(&t.id))
            .collect()
    }

    /// Marks every session's extension-side tab ids as stale. Called when
    /// the extension link drops; ownership itself is kept.
    pub fn mark_tabs_stale(&self) {
        for mut session in self.sessions.iter_mut() {
            session.tabs_stale = true;
            session.attached_tab = None;
        }
    }

    // ─── Attached Tab & Activity ────────────────────────────────

    pub fn set_attached(&self, client_id: &str, tab: TabInfo) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.tabs.insert(tab.id);
            session.tabs_stale = false;
            session.attached_tab = Some(tab);
        }
    }

    pub fn attached(&self, client_id: &str) -> Option<TabInfo> {
        self.sessions
            .get(client_id)
            .and_then(|s| s.attached_tab.clone())
    }

    pub fn set_tech_stack(&self, client_id: &str, tech: String) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            if let Some(tab) = session.attached_tab.as_mut() {
                tab.tech_stack = Some(tech);
            }
        }
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(client_id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn idle_for(&self, client_id: &str) -> Option<Duration> {
        self.sessions
            .get(client_id)
            .map(|s| s.last_activity.elapsed())
    }

    // ─── Experiments & Humanization ─────────────────────────────

    /// Session-effective experiment flag: the per-session override when
    /// present, the Connection-wide flag otherwise.
    pub fn effective_experiment(
        &self,
        client_id: &str,
        exp: Experiment,
        registry: &ExperimentRegistry,
    ) -> bool {
        let override_value = self
            .sessions
            .get(client_id)
            .and_then(|s| s.overrides.get(&exp).copied());
        override_value.unwrap_or_else(|| registry.is_enabled(exp))
    }

    /// Runs `f` against the session's mouse state, creating it on first
    /// use so the personality is sampled at most once per session.
    pub fn with_mouse<T>(&self, client_id: &str, f: impl FnOnce(&mut MouseSession) -> T) -> Option<T> {
        let mut session = self.sessions.get_mut(client_id)?;
        let mouse = session.mouse.get_or_insert_with(MouseSession::new);
        Some(f(mouse))
    }

    /// Stores the latest page-state capture, returning the previous one.
    pub fn swap_page_state(
        &self,
        client_id: &str,
        state: serde_json::Value,
    ) -> Option<serde_json::Value> {
        let mut session = self.sessions.get_mut(client_id)?;
        session.last_page_state.replace(state)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: i64) -> TabInfo {
        TabInfo {
            id,
            index: 0,
            title: None,
            url: None,
            tech_stack: None,
        }
    }

    #[test]
    fn duplicate_client_id_is_rejected_without_disturbing_existing() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.assign_tab("A", 1);

        let err = registry.create("A", HashMap::new()).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateSession(_)));
        assert!(registry.check_owns("A", 1).is_ok());
    }

    #[test]
    fn cross_session_tab_access_is_permission_denied() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.create("B", HashMap::new()).unwrap();
        registry.assign_tab("A", 42);

        assert!(registry.check_owns("A", 42).is_ok());
        let err = registry.check_owns("B", 42).unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
        let err = registry.resolve_tab("B", Some(42)).unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
    }

    #[test]
    fn unowned_tabs_are_denied_even_with_no_owner() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        let err = registry.resolve_tab("A", Some(99)).unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
    }

    #[test]
    fn resolve_tab_substitutes_the_attached_tab() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        assert!(registry.resolve_tab("A", None).is_err());

        registry.set_attached("A", tab(7));
        assert_eq!(registry.resolve_tab("A", None).unwrap(), 7);
    }

    #[test]
    fn list_results_are_filtered_to_owned_tabs() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.assign_tab("A", 1);
        registry.assign_tab("A", 2);

        let visible = registry.filter_owned("A", vec![tab(1), tab(2), tab(3)]);
        assert_eq!(visible.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn removal_clears_ownership() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.assign_tab("A", 1);
        assert!(registry.remove("A"));
        assert!(registry.check_owns("A", 1).is_err());
        // The id is free for a new session.
        registry.create("A", HashMap::new()).unwrap();
        assert!(registry.check_owns("A", 1).is_err());
    }

    #[test]
    fn extension_loss_marks_tabs_stale_but_keeps_ownership() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.set_attached("A", tab(5));
        registry.mark_tabs_stale();

        assert!(registry.attached("A").is_none());
        assert!(registry.check_owns("A", 5).is_ok());
    }

    #[test]
    fn closing_the_attached_tab_detaches_it() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        registry.set_attached("A", tab(5));
        registry.release_tab("A", 5);
        assert!(registry.attached("A").is_none());
        assert!(registry.check_owns("A", 5).is_err());
    }

    #[test]
    fn session_overrides_shadow_connection_flags() {
        let registry = SessionRegistry::new();
        let experiments = ExperimentRegistry::new();
        experiments.set(Experiment::SmartWaiting, true);

        let mut overrides = HashMap::new();
        overrides.insert(Experiment::SmartWaiting, false);
        registry.create("A", overrides).unwrap();
        registry.create("B", HashMap::new()).unwrap();

        assert!(!registry.effective_experiment("A", Experiment::SmartWaiting, &experiments));
        assert!(registry.effective_experiment("B", Experiment::SmartWaiting, &experiments));
    }

    #[test]
    fn mouse_personality_is_sampled_once() {
        let registry = SessionRegistry::new();
        registry.create("A", HashMap::new()).unwrap();
        let first = registry
            .with_mouse("A", |m| m.personality().speed_multiplier)
            .unwrap();
        let second = registry
            .with_mouse("A", |m| m.personality().speed_multiplier)
            .unwrap();
        assert_eq!(first, second);
    }
}
