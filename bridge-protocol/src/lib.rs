//! # Bridge Wire Protocol
//!
//! Types shared by every end of a bridge link: the server, follower
//! servers proxying through a leader, and the browser extension. All three
//! channels (agent stdio, extension WebSocket, leader↔follower WebSocket)
//! carry the same JSON-RPC 2.0 envelope as line/text frames; only the
//! method vocabulary differs per channel.
//!
//! ## Modules
//!
//! - envelope types ([`Request`], [`Response`], [`Frame`])
//! - [`commands`]      — server → extension command names
//! - [`notifications`] — extension → server one-way notification names
//! - handshake payloads ([`ExtensionIdentity`], [`FollowerHello`])

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── JSON-RPC Envelope ──────────────────────────────────────────

/// A JSON-RPC 2.0 request or notification.
///
/// A frame without an `id` is a notification: the receiver must not reply
/// to it. Both directions of every channel use this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Builds a request with the mandatory `"2.0"` version marker.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Builds a notification (no `id`, no reply expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Either side of the envelope, for channels where both requests and
/// responses arrive interleaved (extension and leader↔follower links).
///
/// Deserialization is structural: a frame with a `method` member is a
/// request, one with `result`/`error` is a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

// ─── Handshake Payloads ─────────────────────────────────────────

/// Identity frame the extension sends as its first message after the
/// WebSocket opens (`method = "register"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionIdentity {
    /// Browser product name, e.g. "Chrome" or "Edge".
    pub browser_name: String,
    /// Extension version string.
    pub version: String,
    /// Build timestamp baked into the extension bundle.
    #[serde(default)]
    pub build_timestamp: Option<String>,
}

/// First frame a follower server sends to the leader
/// (`method = "mux_hello"`). The leader registers the follower's agent as
/// an additional session under this identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerHello {
    pub client_id: String,
}

/// Payload of the `client_id_notify` notification sent to the extension
/// right after its identity frame is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdNotify {
    pub client_id: String,
}

// ─── Shared Data Shapes ─────────────────────────────────────────

/// Latest-known metadata for a browser tab, pushed by the extension via
/// the `tab_info_update` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: i64,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Detected technology stack, e.g. "React", if the extension probed it.
    #[serde(default)]
    pub tech_stack: Option<String>,
}

/// One step of a humanized mouse path. The extension replays waypoints in
/// order, sleeping `delay_ms` before dispatching each move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub delay_ms: u64,
}

// ─── Method Vocabulary ──────────────────────────────────────────

/// Handshake methods used on the extension and follower channels.
pub mod handshake {
    /// Extension → server identity frame.
    pub const REGISTER: &str = "register";
    /// Server → extension, carries the active session's client id.
    pub const CLIENT_ID_NOTIFY: &str = "client_id_notify";
    /// Follower → leader identity frame.
    pub const MUX_HELLO: &str = "mux_hello";
}

/// Server → extension command names.
pub mod commands {
    pub const GET_TABS: &str = "getTabs";
    pub const CREATE_TAB: &str = "createTab";
    pub const SELECT_TAB: &str = "selectTab";
    pub const CLOSE_TAB: &str = "closeTab";
    pub const NAVIGATE: &str = "navigate";
    pub const SCREENSHOT: &str = "screenshot";
    pub const SNAPSHOT: &str = "snapshot";
    pub const EVALUATE: &str = "evaluate";
    pub const SECURE_FILL: &str = "secure_fill";
    pub const DIALOG: &str = "dialog";
    pub const WINDOW: &str = "window";
    pub const LIST_EXTENSIONS: &str = "listExtensions";
    pub const RELOAD_EXTENSION: &str = "reloadExtension";
    pub const PERFORMANCE_METRICS: &str = "performanceMetrics";
    pub const FORWARD_CDP_COMMAND: &str = "forwardCDPCommand";
    pub const HUMANIZED_MOUSE_MOVE: &str = "humanizedMouseMove";
    pub const SET_HUMANIZATION_CONFIG: &str = "setHumanizationConfig";
    pub const GET_VIEWPORT_DIMENSIONS: &str = "getViewportDimensions";
    pub const VALIDATE_EVAL: &str = "validateEval";
    pub const CAPTURE_PAGE_STATE: &str = "capturePageState";
    pub const WAIT_FOR_READY: &str = "waitForReady";
    pub const SESSION_DISCONNECT: &str = "sessionDisconnect";
    pub const INSPECT_STORAGE: &str = "inspectStorage";
    pub const UPDATE_WHITELIST: &str = "updateWhitelist";
}

/// Leader → follower relay notifications, so followers can mirror the
/// leader's extension link state.
pub mod mux {
    /// Carries the extension's identity frame to followers.
    pub const EXTENSION_CONNECTED: &str = "mux_extension_connected";
    pub const EXTENSION_DISCONNECTED: &str = "mux_extension_disconnected";
    /// Leader rejected the follower's hello (duplicate identifier).
    pub const DENIED: &str = "mux_denied";
}

/// Extension → server one-way notification names.
pub mod notifications {
    pub const TAB_INFO_UPDATE: &str = "tab_info_update";
    pub const TECH_STACK: &str = "tech_stack";
    pub const CONSOLE: &str = "console";
    pub const NAVIGATION_BLOCKED: &str = "navigation_blocked";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(7, "navigate", Some(json!({"url": "https://example.com"})));
        let text = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, "navigate");
        assert_eq!(back.id, Some(json!(7)));
        assert!(!back.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let note = Request::notification("tab_info_update", None);
        let text = serde_json::to_string(&note).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(note.is_notification());
    }

    #[test]
    fn frame_discriminates_request_from_response() {
        let req: Frame = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "getTabs"
        }))
        .unwrap();
        assert!(matches!(req, Frame::Request(_)));

        let resp: Frame = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "result": {"tabs": []}
        }))
        .unwrap();
        assert!(matches!(resp, Frame::Response(_)));

        let err: Frame = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "no"}
        }))
        .unwrap();
        match err {
            Frame::Response(r) => assert_eq!(r.error.unwrap().code, -32601),
            Frame::Request(_) => panic!("error frame parsed as request"),
        }
    }

    #[test]
    fn tab_info_tolerates_missing_optionals() {
        let tab: TabInfo = serde_json::from_value(json!({"id": 3, "index": 0})).unwrap();
        assert_eq!(tab.id, 3);
        assert!(tab.url.is_none());
        assert!(tab.tech_stack.is_none());
    }
}
