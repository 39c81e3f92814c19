//! # Tool Catalog
//!
//! The static record of every agent-invokable tool: scope, experiment
//! gating, per-call deadline, and the advertised JSON Schema. The
//! catalog itself never changes at runtime; what the agent *sees*
//! changes as experiment toggles flip, and a `tools_changed`
//! notification marks each such epoch.

use std::time::Duration;

use schemars::{schema_for, Schema};
use serde_json::{json, Value};

use super::args;
use crate::experiments::Experiment;
use crate::router::{DEFAULT_DEADLINE, HEAVY_DEADLINE};

/// Where a tool may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScope {
    /// Valid in every connection state; handled locally.
    Connection,
    /// Requires `connected` and acts on an owned tab.
    Tab,
}

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub scope: ToolScope,
    /// Present for experiment-gated tools; a disabled experiment makes
    /// the tool unknown.
    pub experiment: Option<Experiment>,
    /// Only advertised and dispatchable in debug mode.
    pub debug_only: bool,
    pub deadline: Duration,
}

const fn connection(name: &'static str, description: &'static str) -> ToolSpec {
    ToolSpec {
        name,
        description,
        scope: ToolScope::Connection,
        experiment: None,
        debug_only: false,
        deadline: DEFAULT_DEADLINE,
    }
}

const fn tab(name: &'static str, description: &'static str, deadline: Duration) -> ToolSpec {
    ToolSpec {
        name,
        description,
        scope: ToolScope::Tab,
        experiment: None,
        debug_only: false,
        deadline,
    }
}

const fn gated(
    name: &'static str,
    description: &'static str,
    experiment: Experiment,
    deadline: Duration,
) -> ToolSpec {
    ToolSpec {
        name,
        description,
        scope: ToolScope::Tab,
        experiment: Some(experiment),
        debug_only: false,
        deadline,
    }
}

pub static CATALOG: &[ToolSpec] = &[
    connection("enable", "Start the bridge and register this agent's session"),
    connection("disable", "Tear down the bridge and all sessions"),
    connection("status", "Connection state, browser identity and experiment flags"),
    connection("experiment", "Toggle a named experiment"),
    connection("list_tools", "Currently available tools with their schemas"),
    ToolSpec {
        name: "reload",
        description: "Exit with the restart status code so a supervisor respawns the server",
        scope: ToolScope::Connection,
        experiment: None,
        debug_only: true,
        deadline: DEFAULT_DEADLINE,
    },
    tab("browser_list_tabs", "List this session's tabs", DEFAULT_DEADLINE),
    tab("browser_new_tab", "Open a new tab owned by this session", DEFAULT_DEADLINE),
    tab("browser_select_tab", "Attach one of this session's tabs", DEFAULT_DEADLINE),
    tab("browser_close_tab", "Close an owned tab", DEFAULT_DEADLINE),
    tab("browser_navigate", "Navigate a tab and wait for the load to settle", HEAVY_DEADLINE),
    tab("browser_screenshot", "Capture the attached tab", HEAVY_DEADLINE),
    tab("browser_snapshot", "Accessibility snapshot of the attached tab", DEFAULT_DEADLINE),
    tab("browser_evaluate", "Run JavaScript in the page context", DEFAULT_DEADLINE),
    tab(
        "browser_fill_secure",
        "Fill a field from a named environment credential without exposing it",
        DEFAULT_DEADLINE,
    ),
    tab("browser_dialog", "Accept or dismiss the open browser dialog", DEFAULT_DEADLINE),
    tab("browser_window", "Resize or re-state the browser window", DEFAULT_DEADLINE),
    tab("browser_list_extensions", "List installed browser extensions", DEFAULT_DEADLINE),
    tab("browser_reload_extension", "Reload the bridge extension", DEFAULT_DEADLINE),
    tab("browser_performance", "Performance metrics for the attached tab", DEFAULT_DEADLINE),
    tab("browser_cdp", "Forward a raw Chrome DevTools Protocol command", HEAVY_DEADLINE),
    gated(
        "browser_mouse_move",
        "Move the cursor along a humanized path",
        Experiment::MouseHumanization,
        DEFAULT_DEADLINE,
    ),
    gated(
        "browser_wait_ready",
        "Wait until the page settles",
        Experiment::SmartWaiting,
        HEAVY_DEADLINE,
    ),
    gated(
        "browser_page_diff",
        "Capture page state and diff it against the previous capture",
        Experiment::PageDiffing,
        DEFAULT_DEADLINE,
    ),
    gated(
        "browser_storage",
        "Inspect the page's storage areas",
        Experiment::StorageInspection,
        DEFAULT_DEADLINE,
    ),
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// JSON Schema for a tool's arguments, generated from its DTO.
pub fn schema(name: &str) -> Option<Schema> {
    let schema = match name {
        "enable" => schema_for!(args::EnableArgs),
        "disable" | "status" | "list_tools" | "reload" => schema_for!(args::EmptyArgs),
        "experiment" => schema_for!(args::ExperimentArgs),
        "browser_list_tabs" => schema_for!(args::ListTabsArgs),
        "browser_new_tab" => schema_for!(args::NewTabArgs),
        "browser_select_tab" => schema_for!(args::SelectTabArgs),
        "browser_close_tab" => schema_for!(args::CloseTabArgs),
        "browser_navigate" => schema_for!(args::NavigateArgs),
        "browser_screenshot" => schema_for!(args::ScreenshotArgs),
        "browser_snapshot" => schema_for!(args::SnapshotArgs),
        "browser_evaluate" => schema_for!(args::EvaluateArgs),
        "browser_fill_secure" => schema_for!(args::FillSecureArgs),
        "browser_dialog" => schema_for!(args::DialogArgs),
        "browser_window" => schema_for!(args::WindowArgs),
        "browser_list_extensions" => schema_for!(args::ListTabsArgs),
        "browser_reload_extension" => schema_for!(args::ReloadExtensionArgs),
        "browser_performance" => schema_for!(args::PerformanceArgs),
        "browser_cdp" => schema_for!(args::CdpArgs),
        "browser_mouse_move" => schema_for!(args::MouseMoveArgs),
        "browser_wait_ready" => schema_for!(args::WaitReadyArgs),
        "browser_page_diff" => schema_for!(args::PageDiffArgs),
        "browser_storage" => schema_for!(args::StorageArgs),
        _ => return None,
    };
    Some(schema)
}

/// Catalog entries visible under the current flags: debug-only entries
/// need debug mode, gated entries need their experiment effective for
/// the invoker.
pub fn advertised(debug: bool, experiment_on: impl Fn(Experiment) -> bool) -> Vec<Value> {
    CATALOG
        .iter()
        .filter(|spec| !spec.debug_only || debug)
        .filter(|spec| spec.experiment.map(&experiment_on).unwrap_or(true))
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "inputSchema": schema(spec.name)
                    .and_then(|s| serde_json::to_value(&s).ok())
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_entry_has_a_schema() {
        for spec in CATALOG {
            assert!(schema(spec.name).is_some(), "no schema for {}", spec.name);
        }
    }

    #[test]
    fn gated_tools_disappear_when_their_experiment_is_off() {
        let visible = advertised(false, |_| false);
        let names: Vec<&str> = visible
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"browser_navigate"));
        assert!(!names.contains(&"browser_mouse_move"));
        assert!(!names.contains(&"reload"));

        let visible = advertised(true, |_| true);
        let names: Vec<&str> = visible
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"browser_mouse_move"));
        assert!(names.contains(&"reload"));
    }

    #[test]
    fn heavy_calls_get_the_long_deadline() {
        assert_eq!(find("browser_screenshot").unwrap().deadline, HEAVY_DEADLINE);
        assert_eq!(find("browser_cdp").unwrap().deadline, HEAVY_DEADLINE);
        assert_eq!(find("browser_list_tabs").unwrap().deadline, DEFAULT_DEADLINE);
    }
}
