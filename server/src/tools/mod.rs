//! # Tool Dispatcher
//!
//! Central dispatch for every inbound agent request:
//!
//! 1. Catalog lookup — unknown names are `MethodNotFound`
//! 2. Debug and experiment gating — gated-off tools are unknown
//! 3. State precondition — tab-scoped tools need `connected`
//! 4. Argument validation against the tool's DTO
//! 5. Credential substitution where the tool carries one
//! 6. Dispatch, locally or through the router to the extension
//!
//! Connection-scope tools never round-trip to the extension.

pub mod args;
pub mod catalog;

use std::collections::HashMap;
use std::sync::Arc;

use bridge_protocol::{commands, TabInfo};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::connection::{parse_viewport, Connection, LinkState};
use crate::credentials;
use crate::error::{BridgeError, Result};
use crate::experiments::Experiment;
use crate::secure_eval::{self, EvalVerdict};
use catalog::{ToolScope, ToolSpec};

/// Exit code that tells a supervisor to respawn the server.
pub const RESTART_EXIT_CODE: i32 = 42;

/// Runs one tool invocation for the stdio agent's session.
pub async fn dispatch(conn: &Arc<Connection>, method: &str, params: Option<Value>) -> Result<Value> {
    let invoker = conn.primary_session().await;
    dispatch_as(conn, invoker.as_deref(), method, params).await
}

/// Runs one tool invocation annotated with its invoker session. The
/// stdio agent resolves to the primary session; a leader handling
/// follower traffic resolves to the follower's session.
pub async fn dispatch_as(
    conn: &Arc<Connection>,
    invoker: Option<&str>,
    method: &str,
    params: Option<Value>,
) -> Result<Value> {
    let spec = catalog::find(method)
        .ok_or_else(|| BridgeError::MethodNotFound(method.to_string()))?;

    if spec.debug_only && !conn.config.debug {
        return Err(BridgeError::MethodNotFound(method.to_string()));
    }

    if let Some(experiment) = spec.experiment {
        let on = match invoker {
            Some(id) => conn
                .sessions
                .effective_experiment(id, experiment, &conn.experiments),
            None => conn.experiments.is_enabled(experiment),
        };
        if !on {
            // The catalog advertises gated-off tools as unavailable.
            return Err(BridgeError::MethodNotFound(method.to_string()));
        }
    }

    if spec.scope == ToolScope::Tab && conn.state().await != LinkState::Connected {
        return Err(BridgeError::NotConnected);
    }

    if let Some(id) = invoker {
        conn.sessions.touch(id);
    }

    match spec.scope {
        ToolScope::Connection => dispatch_connection(conn, spec, params).await,
        ToolScope::Tab => {
            let invoker = invoker.ok_or(BridgeError::NotConnected)?;
            dispatch_tab(conn, spec, invoker, params).await
        }
    }
}

// ─── Connection-Scope Tools ─────────────────────────────────────

async fn dispatch_connection(
    conn: &Arc<Connection>,
    spec: &ToolSpec,
    params: Option<Value>,
) -> Result<Value> {
    match spec.name {
        "enable" => {
            let args: args::EnableArgs = args::parse(params)?;
            let client_id = args.client_id.unwrap_or_default();
            let overrides = parse_overrides(args.experiments)?;
            let result = conn.enable(&client_id, overrides).await?;
            if result["status"] == "enabled" {
                crate::connection::spawn_drift_task(conn, client_id.trim());
            }
            Ok(result)
        }
        "disable" => conn.disable().await,
        "status" => Ok(conn.status_payload().await),
        "experiment" => {
            let args: args::ExperimentArgs = args::parse(params)?;
            let experiment = Experiment::from_name(&args.name).ok_or_else(|| {
                BridgeError::InvalidArguments(format!("unknown experiment \"{}\"", args.name))
            })?;
            if experiment == Experiment::Multiplexer && conn.state().await != LinkState::Passive {
                return Err(BridgeError::InvalidArguments(
                    "multiplexer is decided at enable time".to_string(),
                ));
            }
            conn.experiments.set(experiment, args.enabled);
            conn.notify_tools_changed().await;
            Ok(json!({ "experiments": conn.experiments.snapshot() }))
        }
        "list_tools" => {
            let invoker = conn.primary_session().await;
            let tools = catalog::advertised(conn.config.debug, |experiment| {
                match invoker.as_deref() {
                    Some(id) => conn
                        .sessions
                        .effective_experiment(id, experiment, &conn.experiments),
                    None => conn.experiments.is_enabled(experiment),
                }
            });
            Ok(json!({ "tools": tools }))
        }
        "reload" => {
            info!("Reload requested; exiting with restart code");
            tokio::spawn(async {
                // Give the response a moment to flush before exiting.
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                std::process::exit(RESTART_EXIT_CODE);
            });
            Ok(json!({ "status": "restarting", "exit_code": RESTART_EXIT_CODE }))
        }
        other => Err(BridgeError::MethodNotFound(other.to_string())),
    }
}

fn parse_overrides(
    raw: Option<HashMap<String, bool>>,
) -> Result<HashMap<Experiment, bool>> {
    let mut overrides = HashMap::new();
    for (name, enabled) in raw.unwrap_or_default() {
        let experiment = Experiment::from_name(&name).ok_or_else(|| {
            BridgeError::InvalidArguments(format!("unknown experiment \"{}\"", name))
        })?;
        overrides.insert(experiment, enabled);
    }
    Ok(overrides)
}

// ─── Tab-Scope Tools ────────────────────────────────────────────

async fn dispatch_tab(
    conn: &Arc<Connection>,
    spec: &ToolSpec,
    invoker: &str,
    params: Option<Value>,
) -> Result<Value> {
    let deadline = spec.deadline;
    match spec.name {
        "browser_list_tabs" => {
            let _: args::ListTabsArgs = args::parse(params)?;
            let result = conn.router.dispatch(commands::GET_TABS, None, deadline).await?;
            let tabs = parse_tab_list(&result);
            let visible = conn.sessions.filter_owned(invoker, tabs);
            Ok(json!({ "tabs": visible }))
        }
        "browser_new_tab" => {
            let args: args::NewTabArgs = args::parse(params)?;
            let result = conn
                .router
                .dispatch(commands::CREATE_TAB, Some(json!({ "url": args.url })), deadline)
                .await?;
            if let Some(tab) = parse_tab(&result) {
                conn.sessions.assign_tab(invoker, tab.id);
                conn.sessions.set_attached(invoker, tab);
            }
            Ok(result)
        }
        "browser_select_tab" => {
            let args: args::SelectTabArgs = args::parse(params)?;
            conn.sessions.check_owns(invoker, args.tab_id)?;
            let result = conn
                .router
                .dispatch(
                    commands::SELECT_TAB,
                    Some(json!({ "tab_id": args.tab_id })),
                    deadline,
                )
                .await?;
            let tab = parse_tab(&result).unwrap_or(TabInfo {
                id: args.tab_id,
                index: 0,
                title: None,
                url: None,
                tech_stack: None,
            });
            conn.sessions.set_attached(invoker, tab);
            Ok(result)
        }
        "browser_close_tab" => {
            let args: args::CloseTabArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            let result = conn
                .router
                .dispatch(commands::CLOSE_TAB, Some(json!({ "tab_id": tab_id })), deadline)
                .await?;
            conn.sessions.release_tab(invoker, tab_id);
            Ok(result)
        }
        "browser_navigate" => {
            let args: args::NavigateArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            let navigated = conn
                .router
                .dispatch(
                    commands::NAVIGATE,
                    Some(json!({ "tab_id": tab_id, "url": args.url })),
                    deadline,
                )
                .await?;
            // Navigation settles before the tool returns; callers may
            // screenshot immediately after.
            let ready = conn
                .router
                .dispatch(
                    commands::WAIT_FOR_READY,
                    Some(json!({ "tab_id": tab_id })),
                    deadline,
                )
                .await?;
            Ok(json!({ "navigate": navigated, "ready": ready }))
        }
        "browser_screenshot" => {
            let args: args::ScreenshotArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::SCREENSHOT,
                    Some(json!({ "tab_id": tab_id, "full_page": args.full_page })),
                    deadline,
                )
                .await
        }
        "browser_snapshot" => {
            let args: args::SnapshotArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(commands::SNAPSHOT, Some(json!({ "tab_id": tab_id })), deadline)
                .await
        }
        "browser_evaluate" => {
            let args: args::EvaluateArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            if conn
                .sessions
                .effective_experiment(invoker, Experiment::SecureEval, &conn.experiments)
            {
                if let EvalVerdict::Blocked(reason) = secure_eval::analyze(&args.code)? {
                    return Err(BridgeError::BlockedApi(reason));
                }
            }
            conn.router
                .dispatch(
                    commands::EVALUATE,
                    Some(json!({ "tab_id": tab_id, "code": args.code })),
                    deadline,
                )
                .await
        }
        "browser_fill_secure" => {
            let args: args::FillSecureArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            let credential = credentials::resolve(&args.selector, &args.credential_env)?;
            let mut params = match credential.into_params() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            params.insert("tab_id".to_string(), json!(tab_id));
            conn.router
                .dispatch(commands::SECURE_FILL, Some(Value::Object(params)), deadline)
                .await
        }
        "browser_dialog" => {
            let args: args::DialogArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::DIALOG,
                    Some(json!({ "tab_id": tab_id, "action": args.action, "text": args.text })),
                    deadline,
                )
                .await
        }
        "browser_window" => {
            let args: args::WindowArgs = args::parse(params)?;
            conn.router
                .dispatch(
                    commands::WINDOW,
                    Some(json!({
                        "action": args.action,
                        "width": args.width,
                        "height": args.height,
                    })),
                    deadline,
                )
                .await
        }
        "browser_list_extensions" => {
            let _: args::ListTabsArgs = args::parse(params)?;
            conn.router
                .dispatch(commands::LIST_EXTENSIONS, None, deadline)
                .await
        }
        "browser_reload_extension" => {
            let args: args::ReloadExtensionArgs = args::parse(params)?;
            conn.router
                .dispatch(
                    commands::RELOAD_EXTENSION,
                    Some(json!({ "extension_id": args.extension_id })),
                    deadline,
                )
                .await
        }
        "browser_performance" => {
            let args: args::PerformanceArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::PERFORMANCE_METRICS,
                    Some(json!({ "tab_id": tab_id })),
                    deadline,
                )
                .await
        }
        "browser_cdp" => {
            let args: args::CdpArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::FORWARD_CDP_COMMAND,
                    Some(json!({
                        "tab_id": tab_id,
                        "method": args.method,
                        "params": args.params,
                    })),
                    deadline,
                )
                .await
        }
        "browser_mouse_move" => {
            let args: args::MouseMoveArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            // The viewport is fetched per move: window resizes between
            // moves would otherwise clamp against stale bounds.
            let viewport = conn
                .router
                .dispatch(
                    commands::GET_VIEWPORT_DIMENSIONS,
                    Some(json!({ "tab_id": tab_id })),
                    deadline,
                )
                .await?;
            let viewport = parse_viewport(&viewport).ok_or_else(|| {
                BridgeError::ExtensionError("malformed viewport dimensions".to_string())
            })?;
            let waypoints = conn
                .sessions
                .with_mouse(invoker, |m| m.plan_move(args.x, args.y, viewport))
                .ok_or(BridgeError::NotConnected)?;
            let count = waypoints.len();
            let cursor = waypoints.last().map(|w| (w.x, w.y)).unwrap_or_default();
            conn.router
                .dispatch(
                    commands::HUMANIZED_MOUSE_MOVE,
                    Some(json!({ "tab_id": tab_id, "waypoints": waypoints })),
                    deadline,
                )
                .await?;
            Ok(json!({
                "waypoints": count,
                "cursor": { "x": cursor.0, "y": cursor.1 },
            }))
        }
        "browser_wait_ready" => {
            let args: args::WaitReadyArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::WAIT_FOR_READY,
                    Some(json!({ "tab_id": tab_id, "timeout_ms": args.timeout_ms })),
                    deadline,
                )
                .await
        }
        "browser_page_diff" => {
            let args: args::PageDiffArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            let capture = conn
                .router
                .dispatch(
                    commands::CAPTURE_PAGE_STATE,
                    Some(json!({ "tab_id": tab_id })),
                    deadline,
                )
                .await?;
            let previous = conn.sessions.swap_page_state(invoker, capture.clone());
            let diff = shallow_diff(previous.as_ref(), &capture);
            Ok(json!({ "capture": capture, "diff": diff }))
        }
        "browser_storage" => {
            let args: args::StorageArgs = args::parse(params)?;
            let tab_id = conn.sessions.resolve_tab(invoker, args.tab_id)?;
            conn.router
                .dispatch(
                    commands::INSPECT_STORAGE,
                    Some(json!({ "tab_id": tab_id, "kind": args.kind })),
                    deadline,
                )
                .await
        }
        other => Err(BridgeError::MethodNotFound(other.to_string())),
    }
}

// ─── Result Shaping ─────────────────────────────────────────────

fn parse_tab_list(result: &Value) -> Vec<TabInfo> {
    let raw = result
        .get("tabs")
        .cloned()
        .or_else(|| result.as_array().map(|_| result.clone()))
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(raw).unwrap_or_default()
}

fn parse_tab(result: &Value) -> Option<TabInfo> {
    let raw = result.get("tab").unwrap_or(result);
    serde_json::from_value(raw.clone()).ok()
}

/// Top-level comparison of two page-state captures.
fn shallow_diff(previous: Option<&Value>, current: &Value) -> Value {
    let Some(previous) = previous else {
        return json!({ "first_capture": true });
    };
    match (previous.as_object(), current.as_object()) {
        (Some(prev), Some(curr)) => {
            let added: Vec<&String> = curr.keys().filter(|k| !prev.contains_key(*k)).collect();
            let removed: Vec<&String> = prev.keys().filter(|k| !curr.contains_key(*k)).collect();
            let changed: Vec<&String> = curr
                .iter()
                .filter(|(k, v)| prev.get(*k).is_some_and(|p| p != *v))
                .map(|(k, _)| k)
                .collect();
            json!({ "added": added, "removed": removed, "changed": changed })
        }
        _ => json!({ "changed": previous != current }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_diff_reports_key_movement() {
        let prev = json!({ "title": "a", "forms": 1, "gone": true });
        let curr = json!({ "title": "b", "forms": 1, "new": 2 });
        let diff = shallow_diff(Some(&prev), &curr);
        assert_eq!(diff["added"], json!(["new"]));
        assert_eq!(diff["removed"], json!(["gone"]));
        assert_eq!(diff["changed"], json!(["title"]));
    }

    #[test]
    fn first_capture_is_marked() {
        assert_eq!(
            shallow_diff(None, &json!({}))["first_capture"],
            json!(true)
        );
    }

    #[test]
    fn tab_lists_parse_from_either_shape() {
        let wrapped = json!({ "tabs": [{ "id": 1, "index": 0 }] });
        assert_eq!(parse_tab_list(&wrapped).len(), 1);
        let bare = json!([{ "id": 2, "index": 1 }]);
        assert_eq!(parse_tab_list(&bare)[0].id, 2);
        assert!(parse_tab_list(&json!({})).is_empty());
    }
}
