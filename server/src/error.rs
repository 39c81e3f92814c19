//! # Bridge Error Kinds
//!
//! One crate-wide error enum covering every failure the agent can observe.
//! Local/validation failures are produced before any extension dispatch;
//! transport-flavored kinds (`Timeout`, `TransportGone`, `LeaderLost`)
//! come out of the router; the rest wrap extension-reported failures.

use std::time::Duration;

use bridge_protocol::RpcError;
use serde_json::json;
use thiserror::Error;

/// Result type for bridge-server operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Tool arguments failed schema validation. The message is surfaced
    /// verbatim to the agent ("client_id is required", "missing required
    /// field \"url\"", ...).
    #[error("{0}")]
    InvalidArguments(String),

    /// Unknown tool name, or a tool whose gating experiment is disabled.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A tab-scoped tool was invoked while no extension link is up.
    #[error("not connected to a browser extension")]
    NotConnected,

    /// The invoking session does not own the targeted tab.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A follower presented an identifier the leader already tracks.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// No response from the extension before the per-call deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The extension link dropped while the request was in flight.
    #[error("extension transport is gone")]
    TransportGone,

    /// The leader link dropped while a proxied request was in flight.
    /// Retries are the agent's responsibility.
    #[error("leader connection lost")]
    LeaderLost,

    /// The extension replied with an error envelope.
    #[error("extension error: {0}")]
    ExtensionError(String),

    /// Credential substitution named an environment variable that is
    /// absent from the server's environment.
    #[error("environment variable not set: {0}")]
    EnvVarUnset(String),

    /// Evaluated source touched a blocked API.
    #[error("blocked api: {0}")]
    BlockedApi(String),

    /// Navigation target rejected by the whitelist.
    #[error("navigation target not whitelisted: {0}")]
    WhitelistViolation(String),

    /// The WebSocket port is taken and the multiplexer is not opted in.
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// `enable` supplied a client identifier another session holds.
    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    /// Underlying I/O failure (socket, cache file, stdio).
    #[error("io error: {0}")]
    Io(String),
}

impl BridgeError {
    /// Stable kind name carried in the JSON-RPC `error.data` member so
    /// agents can branch without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidArguments(_) => "InvalidArguments",
            BridgeError::MethodNotFound(_) => "MethodNotFound",
            BridgeError::NotConnected => "NotConnected",
            BridgeError::PermissionDenied(_) => "PermissionDenied",
            BridgeError::AlreadyRegistered(_) => "AlreadyRegistered",
            BridgeError::Timeout(_) => "Timeout",
            BridgeError::TransportGone => "TransportGone",
            BridgeError::LeaderLost => "LeaderLost",
            BridgeError::ExtensionError(_) => "ExtensionError",
            BridgeError::EnvVarUnset(_) => "EnvVarUnset",
            BridgeError::BlockedApi(_) => "BlockedApi",
            BridgeError::WhitelistViolation(_) => "WhitelistViolation",
            BridgeError::PortInUse(_) => "PortInUse",
            BridgeError::DuplicateSession(_) => "DuplicateSession",
            BridgeError::Io(_) => "Io",
        }
    }

    /// JSON-RPC error code. Standard codes for the two lookup failures,
    /// implementation-defined `-320xx` codes for the rest.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::MethodNotFound(_) => -32601,
            BridgeError::InvalidArguments(_) => -32602,
            BridgeError::ExtensionError(_) => -32000,
            BridgeError::NotConnected => -32002,
            BridgeError::PermissionDenied(_) => -32003,
            BridgeError::AlreadyRegistered(_) => -32004,
            BridgeError::TransportGone => -32005,
            BridgeError::LeaderLost => -32006,
            BridgeError::Timeout(_) => -32008,
            BridgeError::EnvVarUnset(_) => -32009,
            BridgeError::BlockedApi(_) => -32010,
            BridgeError::WhitelistViolation(_) => -32011,
            BridgeError::PortInUse(_) => -32012,
            BridgeError::DuplicateSession(_) => -32013,
            BridgeError::Io(_) => -32603,
        }
    }

    /// Converts into the wire error envelope.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: Some(json!({ "kind": self.kind() })),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::InvalidArguments(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_arguments_message_is_verbatim() {
        let err = BridgeError::InvalidArguments("client_id is required".into());
        assert_eq!(err.to_string(), "client_id is required");
    }

    #[test]
    fn rpc_error_carries_kind_and_code() {
        let err = BridgeError::Timeout(Duration::from_secs(45));
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32008);
        assert_eq!(rpc.data.unwrap()["kind"], "Timeout");
    }

    #[test]
    fn method_not_found_uses_standard_code() {
        assert_eq!(BridgeError::MethodNotFound("x".into()).code(), -32601);
    }
}
