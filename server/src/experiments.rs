//! # Experiment Registry
//!
//! Process-wide opt-in toggles. The initial set comes from the
//! `BRIDGE_EXPERIMENTS` environment variable (comma-separated names) at
//! startup; the `experiment` tool flips flags afterwards. `disable`
//! resets the registry back to the startup set.
//!
//! The `multiplexer` flag is infrastructure-scope: it selects the
//! transport at enable time and cannot be flipped while a transport is
//! live. The rest are session-scope and may additionally be overridden
//! per session at enable time.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::warn;

/// Environment variable naming experiments to pre-enable.
pub const EXPERIMENTS_ENV: &str = "BRIDGE_EXPERIMENTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Experiment {
    PageDiffing,
    SmartWaiting,
    StorageInspection,
    MouseHumanization,
    SecureEval,
    Multiplexer,
}

impl Experiment {
    pub const ALL: [Experiment; 6] = [
        Experiment::PageDiffing,
        Experiment::SmartWaiting,
        Experiment::StorageInspection,
        Experiment::MouseHumanization,
        Experiment::SecureEval,
        Experiment::Multiplexer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Experiment::PageDiffing => "page_diffing",
            Experiment::SmartWaiting => "smart_waiting",
            Experiment::StorageInspection => "storage_inspection",
            Experiment::MouseHumanization => "mouse_humanization",
            Experiment::SecureEval => "secure_eval",
            Experiment::Multiplexer => "multiplexer",
        }
    }

    pub fn from_name(name: &str) -> Option<Experiment> {
        Experiment::ALL.iter().copied().find(|e| e.name() == name)
    }
}

/// Connection-wide flag registry.
pub struct ExperimentRegistry {
    flags: DashMap<Experiment, bool>,
    /// Startup snapshot, restored on `disable`.
    initial: Vec<Experiment>,
}

impl ExperimentRegistry {
    /// Builds a registry with every flag off.
    pub fn new() -> Self {
        let flags = DashMap::new();
        for exp in Experiment::ALL {
            flags.insert(exp, false);
        }
        Self {
            flags,
            initial: Vec::new(),
        }
    }

    /// Builds a registry pre-enabling the experiments named in `raw`
    /// (the comma-separated value of [`EXPERIMENTS_ENV`]). Unknown names
    /// are skipped with a warning.
    pub fn from_env_value(raw: &str) -> Self {
        let mut registry = Self::new();
        let mut initial = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Experiment::from_name(name) {
                Some(exp) => {
                    registry.flags.insert(exp, true);
                    initial.push(exp);
                }
                None => warn!(experiment = name, "Unknown experiment in {}", EXPERIMENTS_ENV),
            }
        }
        registry.initial = initial;
        registry
    }

    /// Reads [`EXPERIMENTS_ENV`] from the process environment.
    pub fn from_env() -> Self {
        match std::env::var(EXPERIMENTS_ENV) {
            Ok(raw) => Self::from_env_value(&raw),
            Err(_) => Self::new(),
        }
    }

    pub fn is_enabled(&self, exp: Experiment) -> bool {
        self.flags.get(&exp).map(|v| *v).unwrap_or(false)
    }

    pub fn set(&self, exp: Experiment, enabled: bool) {
        self.flags.insert(exp, enabled);
    }

    /// Restores the startup set. Called on `disable`.
    pub fn reset(&self) {
        for exp in Experiment::ALL {
            self.flags.insert(exp, false);
        }
        for exp in &self.initial {
            self.flags.insert(*exp, true);
        }
    }

    /// Current flags as a name → enabled map, for the `status` tool.
    pub fn snapshot(&self) -> HashMap<&'static str, bool> {
        Experiment::ALL
            .iter()
            .map(|e| (e.name(), self.is_enabled(*e)))
            .collect()
    }
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_preloads_known_names() {
        let registry = ExperimentRegistry::from_env_value("mouse_humanization, secure_eval");
        assert!(registry.is_enabled(Experiment::MouseHumanization));
        assert!(registry.is_enabled(Experiment::SecureEval));
        assert!(!registry.is_enabled(Experiment::Multiplexer));
    }

    #[test]
    fn unknown_names_are_skipped() {
        let registry = ExperimentRegistry::from_env_value("warp_drive,page_diffing");
        assert!(registry.is_enabled(Experiment::PageDiffing));
        assert_eq!(registry.snapshot().values().filter(|v| **v).count(), 1);
    }

    #[test]
    fn reset_restores_startup_set() {
        let registry = ExperimentRegistry::from_env_value("smart_waiting");
        registry.set(Experiment::SmartWaiting, false);
        registry.set(Experiment::Multiplexer, true);
        registry.reset();
        assert!(registry.is_enabled(Experiment::SmartWaiting));
        assert!(!registry.is_enabled(Experiment::Multiplexer));
    }
}
