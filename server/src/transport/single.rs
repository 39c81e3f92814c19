//! # Single-Client Transport
//!
//! WebSocket server for the ordinary (non-multiplexed) deployment:
//! one extension client on a loopback port. A new inbound connection
//! replaces the active one — the old link's pending requests fail and a
//! disconnect event fires before the new link is announced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use bridge_protocol::{Frame, Request};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::{classify_first_frame, ActiveLink, EventTx, FirstFrame, LinkSlot, TransportEvent};
use crate::error::{BridgeError, Result};
use crate::router::{LinkKind, Router};

/// How long a fresh socket may sit silent before its identity frame.
const HANDSHAKE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// Shared state handed to every upgrade handler.
struct ExtensionHub {
    router: Arc<Router>,
    events: EventTx,
    current: LinkSlot,
    generation: AtomicU64,
    /// Flips to true on `stop`; live link loops watch it so `disable`
    /// actually closes the socket.
    shutdown: watch::Receiver<bool>,
}

pub struct SingleTransport {
    hub: Arc<ExtensionHub>,
    shutdown: watch::Sender<bool>,
}

impl SingleTransport {
    /// Binds the loopback port and starts serving extension upgrades.
    /// A taken port is reported as `PortInUse`: without the multiplexer
    /// experiment there is no follower mode to fall back to.
    pub async fn start(port: u16, router: Arc<Router>, events: EventTx) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                BridgeError::PortInUse(port)
            } else {
                BridgeError::Io(e.to_string())
            }
        })?;
        info!("Extension endpoint listening on 127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = Arc::new(ExtensionHub {
            router,
            events,
            current: Arc::new(tokio::sync::RwLock::new(None)),
            generation: AtomicU64::new(0),
            shutdown: shutdown_rx.clone(),
        });

        let app = axum::Router::new()
            .route("/ws", get(ws_handler))
            .with_state(hub.clone());

        let mut serve_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                while !*serve_shutdown.borrow() {
                    if serve_shutdown.changed().await.is_err() {
                        break;
                    }
                }
            });
            if let Err(e) = serve.await {
                error!("Extension endpoint error: {}", e);
            }
        });

        Ok(Self {
            hub,
            shutdown: shutdown_tx,
        })
    }

    /// Stops accepting connections and tears down the active link.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.hub.current.write().await.take();
        self.hub.router.clear_link().await;
    }

    /// Queues a fire-and-forget notification to the linked extension.
    pub async fn send(&self, notification: Request) {
        if let Some(link) = self.hub.current.read().await.as_ref() {
            let _ = link.tx.send(notification);
        }
    }
}

/// `GET /ws` — upgrades to a WebSocket and hands off to the link
/// lifecycle.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<ExtensionHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_extension(socket, hub))
}

/// Full lifecycle of one extension WebSocket:
///
/// 1. Await the identity frame (with a deadline)
/// 2. Spawn the outbound writer task
/// 3. Replace any previously active link (its pending requests fail)
/// 4. Route inbound frames until the socket closes
/// 5. If still the current link, announce the disconnect
async fn handle_extension(socket: WebSocket, hub: Arc<ExtensionHub>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let identity = match tokio::time::timeout(HANDSHAKE_DEADLINE, first_text(&mut ws_stream)).await
    {
        Ok(Some(text)) => match classify_first_frame(&text) {
            Ok(FirstFrame::Extension(identity)) => identity,
            Ok(FirstFrame::Follower(_)) => {
                warn!("Follower hello on a single-client endpoint; closing");
                let _ = ws_sink.close().await;
                return;
            }
            Err(e) => {
                warn!("Bad identity frame: {}", e);
                let _ = ws_sink.close().await;
                return;
            }
        },
        _ => {
            warn!("Extension handshake timed out");
            let _ = ws_sink.close().await;
            return;
        }
    };
    info!(
        browser = %identity.browser_name,
        version = %identity.version,
        "Extension connected"
    );

    // ── Outbound Writer ──
    let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!("Serialize error: {}", e);
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break; // socket closed; stop draining
            }
        }
    });

    // ── Replace the Active Link ──
    let generation = hub.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let replaced = hub
        .current
        .write()
        .await
        .replace(ActiveLink {
            tx: tx.clone(),
            generation,
        })
        .is_some();
    if replaced {
        // The old link is gone from its point of view: fail its pending
        // requests and let the state machine see the drop first.
        hub.router.clear_link().await;
        let _ = hub.events.send(TransportEvent::ExtensionDisconnected);
    }
    hub.router.set_link(tx.clone(), LinkKind::Extension).await;
    let _ = hub
        .events
        .send(TransportEvent::ExtensionConnected { identity });

    // ── Inbound Loop ──
    let mut shutdown = hub.shutdown.clone();
    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => route_frame(&hub, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Extension socket error: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // ── Cleanup ──
    writer.abort();
    let mut current = hub.current.write().await;
    let still_current = current
        .as_ref()
        .is_some_and(|link| link.generation == generation);
    if still_current {
        current.take();
        drop(current);
        hub.router.clear_link().await;
        let _ = hub.events.send(TransportEvent::ExtensionDisconnected);
        info!("Extension disconnected");
    }
}

/// Routes one inbound text frame: responses to the router, notifications
/// to the event loop. Extensions never originate requests with ids.
fn route_frame(hub: &ExtensionHub, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Response(response)) => hub.router.handle_response(response),
        Ok(Frame::Request(request)) if request.is_notification() => {
            let _ = hub.events.send(TransportEvent::Notification {
                method: request.method,
                params: request.params,
            });
        }
        Ok(Frame::Request(request)) => {
            warn!(method = %request.method, "Unexpected request from extension dropped");
        }
        Err(e) => warn!("Unparseable extension frame dropped: {}", e),
    }
}

async fn first_text(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<String> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => return Some(text.to_string()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}
