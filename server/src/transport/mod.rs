//! # Extension Transport
//!
//! The duplex link between this server and the browser extension — or,
//! in multiplexer mode, between this server and whichever peer owns the
//! extension. The single-client transport and the multiplexer are
//! interchangeable behind one shape: a closed sum type with the
//! `start` / `stop` / `send` / `notify_client_id` surface, plus an event
//! stream the connection layer consumes for reconnects and tab updates.
//!
//! Transports never interpret command names; they validate framing,
//! route responses into the [`Router`], and surface everything else as
//! [`TransportEvent`]s.

mod mux;
mod single;

pub use mux::MuxTransport;
pub use single::SingleTransport;

use std::sync::Arc;

use bridge_protocol::{ExtensionIdentity, Frame, Request};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Events the transport pushes to the connection layer's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// An extension completed its identity handshake (directly, or — on a
    /// follower — as relayed by the leader).
    ExtensionConnected { identity: ExtensionIdentity },
    /// The extension link dropped, or a new extension replaced it.
    ExtensionDisconnected,
    /// One-way notification from the extension (`tab_info_update`,
    /// `tech_stack`, `console`, `navigation_blocked`).
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Leader only: a follower server registered / dropped.
    FollowerJoined { client_id: String },
    FollowerLeft { client_id: String },
    /// Follower only: the leader link dropped; in-flight proxied calls
    /// have been failed with `LeaderLost`.
    LeaderLost,
    /// Follower only: won the port-rebind race and now owns the port.
    PromotedToLeader,
}

pub type EventTx = mpsc::UnboundedSender<TransportEvent>;
pub type EventRx = mpsc::UnboundedReceiver<TransportEvent>;

/// The active transport. `Single` serves exactly one extension client;
/// `Mux` additionally serves follower servers or proxies through a
/// leader, depending on who owns the port.
pub enum Transport {
    Single(SingleTransport),
    Mux(MuxTransport),
}

impl Transport {
    /// Stops the transport: closes the listener (or the leader link),
    /// drops any extension link, and fails in-flight requests.
    pub async fn stop(&self) {
        match self {
            Transport::Single(t) => t.stop().await,
            Transport::Mux(t) => t.stop().await,
        }
    }

    /// Fire-and-forget notification to the extension, if one is linked.
    /// Requests with response correlation go through the router instead.
    pub async fn send(&self, notification: Request) {
        match self {
            Transport::Single(t) => t.send(notification).await,
            Transport::Mux(t) => t.send(notification).await,
        }
    }

    /// Pushes the enabling session's identifier to the extension,
    /// completing the handshake.
    pub async fn notify_client_id(&self, client_id: &str) {
        let params = serde_json::json!({ "client_id": client_id });
        self.send(Request::notification(
            bridge_protocol::handshake::CLIENT_ID_NOTIFY,
            Some(params),
        ))
        .await;
    }
}

/// Outcome of reading a link's first frame.
pub(crate) enum FirstFrame {
    Extension(ExtensionIdentity),
    Follower(String),
}

/// Interprets the first text frame of a freshly opened WebSocket:
/// extensions introduce themselves with `register`, follower servers
/// with `mux_hello`. Anything else is a framing violation.
pub(crate) fn classify_first_frame(text: &str) -> Result<FirstFrame> {
    let frame: Frame = serde_json::from_str(text)?;
    let request = match frame {
        Frame::Request(request) => request,
        Frame::Response(_) => {
            return Err(crate::error::BridgeError::InvalidArguments(
                "expected an identity frame, got a response".to_string(),
            ))
        }
    };
    match request.method.as_str() {
        bridge_protocol::handshake::REGISTER => {
            let identity: ExtensionIdentity =
                serde_json::from_value(request.params.unwrap_or(Value::Null))?;
            Ok(FirstFrame::Extension(identity))
        }
        bridge_protocol::handshake::MUX_HELLO => {
            let hello: bridge_protocol::FollowerHello =
                serde_json::from_value(request.params.unwrap_or(Value::Null))?;
            Ok(FirstFrame::Follower(hello.client_id))
        }
        other => Err(crate::error::BridgeError::InvalidArguments(format!(
            "unexpected handshake method \"{}\"",
            other
        ))),
    }
}

/// A registered peer link: the queue its writer task drains, plus a
/// generation stamp so a replaced link can tell it is no longer current.
#[derive(Clone)]
pub(crate) struct ActiveLink {
    pub tx: mpsc::UnboundedSender<Request>,
    pub generation: u64,
}

pub(crate) type LinkSlot = Arc<tokio::sync::RwLock<Option<ActiveLink>>>;
