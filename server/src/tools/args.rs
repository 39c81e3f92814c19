//! # Tool Argument Shapes
//!
//! One DTO per tool, the single source of truth for both validation
//! (serde) and the advertised JSON Schemas (schemars). Serde errors are
//! translated to `InvalidArguments` with the missing field named.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Deserializes a tool's params, mapping serde failures to the
/// agent-facing validation error.
pub fn parse<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T> {
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| translate_serde_error(&e))
}

/// Turns `missing field `url`` into `missing required field "url"`;
/// everything else passes through as-is.
fn translate_serde_error(error: &serde_json::Error) -> BridgeError {
    let text = error.to_string();
    if text.contains("missing field") {
        if let Some(start) = text.find('`') {
            if let Some(len) = text[start + 1..].find('`') {
                let field = &text[start + 1..start + 1 + len];
                return BridgeError::InvalidArguments(format!(
                    "missing required field \"{}\"",
                    field
                ));
            }
        }
    }
    BridgeError::InvalidArguments(text)
}

// ─── Connection Scope ───────────────────────────────────────────

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct EnableArgs {
    /// Stable identifier for this agent's session. Required; validated
    /// by hand so the agent sees "client_id is required".
    #[serde(default)]
    pub client_id: Option<String>,
    /// Per-session experiment overrides on top of the connection flags.
    #[serde(default)]
    pub experiments: Option<HashMap<String, bool>>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct EmptyArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExperimentArgs {
    /// Experiment name, e.g. "mouse_humanization".
    pub name: String,
    pub enabled: bool,
}

// ─── Tab Scope ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListTabsArgs {}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NewTabArgs {
    /// URL to open; the browser's default page when omitted.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectTabArgs {
    pub tab_id: i64,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CloseTabArgs {
    /// Explicit target; the session's attached tab when omitted.
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NavigateArgs {
    pub url: String,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ScreenshotArgs {
    #[serde(default)]
    pub tab_id: Option<i64>,
    /// Capture the full scrollable page instead of the viewport.
    #[serde(default)]
    pub full_page: Option<bool>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct SnapshotArgs {
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvaluateArgs {
    /// JavaScript source to run in the page context. Subject to the
    /// secure-eval policy when that experiment is on.
    pub code: String,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FillSecureArgs {
    /// Element selector for the field to fill.
    pub selector: String,
    /// Name of the environment variable holding the credential. The
    /// server resolves it locally; the name never reaches the browser.
    pub credential_env: String,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DialogArgs {
    /// "accept" or "dismiss".
    pub action: String,
    /// Prompt text for dialogs that take input.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WindowArgs {
    /// "minimize", "maximize", "fullscreen", "normal" or "resize".
    pub action: String,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ReloadExtensionArgs {
    #[serde(default)]
    pub extension_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct PerformanceArgs {
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CdpArgs {
    /// Raw CDP method, e.g. "Page.captureSnapshot".
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MouseMoveArgs {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct WaitReadyArgs {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct PageDiffArgs {
    #[serde(default)]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct StorageArgs {
    /// "local", "session", "cookies" or "indexeddb"; all when omitted.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub tab_id: Option<i64>,
}
