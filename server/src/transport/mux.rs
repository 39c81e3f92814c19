//! # Multiplexer Transport
//!
//! Dual-mode transport for sharing one browser among several bridge
//! servers. Whoever binds the loopback port is the **leader**: it owns
//! the extension link and additionally accepts WebSocket connections
//! from **follower** servers, treating each as an extra session. A
//! follower proxies every extension-bound command through the leader.
//!
//! Leader death drops every follower's link (in-flight proxied calls
//! fail `LeaderLost`); each follower then sleeps a uniform-random
//! 50–200 ms and retries the port bind. OS-level bind exclusivity picks
//! the single winner; losers reconnect to it as followers. The
//! extension's own reconnect backoff is long enough that a new leader is
//! always in place by the time it retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use bridge_protocol::{commands, handshake, mux, Frame, Request, Response};
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use super::{classify_first_frame, ActiveLink, EventTx, FirstFrame, LinkSlot, TransportEvent};
use crate::error::BridgeError;
use crate::router::{LinkKind, Router, HEAVY_DEADLINE};
use crate::sessions::SessionRegistry;

/// Jitter window for the leader-promotion rebind race, ms.
const PROMOTION_JITTER_MS: (u64, u64) = (50, 200);

/// Pause before retrying after an unexpected bind/connect failure.
const RETRY_DELAY: Duration = Duration::from_millis(500);

struct MuxShared {
    port: u16,
    /// This server's agent identity, presented to the leader.
    client_id: String,
    router: Arc<Router>,
    events: EventTx,
    /// Leader mode: follower sessions and their tab ownership.
    sessions: SessionRegistry,
    /// Leader mode: the active extension link.
    extension: LinkSlot,
    generation: AtomicU64,
    /// Leader mode: outbound queues to registered followers.
    followers: DashMap<String, mpsc::UnboundedSender<Frame>>,
    /// Last extension identity, relayed to late-joining followers.
    identity: RwLock<Option<bridge_protocol::ExtensionIdentity>>,
    /// Flips to true on `stop`; live peer loops watch it so teardown
    /// actually closes their sockets.
    shutdown: watch::Receiver<bool>,
}

pub struct MuxTransport {
    shared: Arc<MuxShared>,
    shutdown: watch::Sender<bool>,
}

impl MuxTransport {
    /// Starts the mode loop. Never fails at start: a taken port just
    /// means this server begins life as a follower.
    pub fn start(
        port: u16,
        client_id: String,
        router: Arc<Router>,
        events: EventTx,
        sessions: SessionRegistry,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(MuxShared {
            port,
            client_id,
            router,
            events,
            sessions,
            extension: Arc::new(RwLock::new(None)),
            generation: AtomicU64::new(0),
            followers: DashMap::new(),
            identity: RwLock::new(None),
            shutdown: shutdown_rx.clone(),
        });
        tokio::spawn(run(shared.clone(), shutdown_rx));
        Self { shared, shutdown }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.shared.extension.write().await.take();
        self.shared.followers.clear();
        self.shared.router.clear_link().await;
    }

    /// Queues a notification toward the extension: directly as leader,
    /// through the leader's relay as follower.
    pub async fn send(&self, notification: Request) {
        if let Some(link) = self.shared.extension.read().await.as_ref() {
            let _ = link.tx.send(notification);
            return;
        }
        // Follower: the router link points at the leader, which forwards
        // whitelisted notifications onward.
        if let Some(link) = self.shared.router.peek_link().await {
            let _ = link.send(notification);
        }
    }
}

// ─── Mode Loop ──────────────────────────────────────────────────

/// Alternates between leader and follower until shutdown. Each loop
/// iteration races the port bind; the jittered delay between iterations
/// is the promotion protocol's only coordination primitive.
async fn run(shared: Arc<MuxShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match TcpListener::bind(("127.0.0.1", shared.port)).await {
            Ok(listener) => {
                info!("Multiplexer: acting as leader on port {}", shared.port);
                let _ = shared.events.send(TransportEvent::PromotedToLeader);
                run_leader(&shared, listener, &shutdown).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                run_follower(&shared, &mut shutdown).await;
            }
            Err(e) => {
                error!("Multiplexer bind failed: {}", e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(PROMOTION_JITTER_MS.0..=PROMOTION_JITTER_MS.1)
        };
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

// ─── Leader Mode ────────────────────────────────────────────────

async fn run_leader(
    shared: &Arc<MuxShared>,
    listener: TcpListener,
    shutdown: &watch::Receiver<bool>,
) {
    let app = axum::Router::new()
        .route("/ws", get(mux_ws_handler))
        .with_state(shared.clone());

    let mut rx = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(e) = serve.await {
        error!("Leader endpoint error: {}", e);
    }
}

async fn mux_ws_handler(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<MuxShared>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_peer(socket, shared))
}

/// One inbound peer: extension or follower, decided by its first frame.
async fn handle_peer(socket: WebSocket, shared: Arc<MuxShared>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let first = match tokio::time::timeout(
        Duration::from_secs(10),
        first_text(&mut ws_stream),
    )
    .await
    {
        Ok(Some(text)) => text,
        _ => {
            let _ = ws_sink.close().await;
            return;
        }
    };

    match classify_first_frame(&first) {
        Ok(FirstFrame::Extension(identity)) => {
            handle_extension_peer(shared, ws_sink, ws_stream, identity).await;
        }
        Ok(FirstFrame::Follower(client_id)) => {
            handle_follower_peer(shared, ws_sink, ws_stream, client_id).await;
        }
        Err(e) => {
            warn!("Bad handshake on multiplexer endpoint: {}", e);
            let _ = ws_sink.close().await;
        }
    }
}

/// Extension lifecycle on a leader. Mirrors the single-client transport
/// and additionally relays link state and notifications to followers.
async fn handle_extension_peer(
    shared: Arc<MuxShared>,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    identity: bridge_protocol::ExtensionIdentity,
) {
    info!(browser = %identity.browser_name, "Extension connected (leader)");

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
                break;
            }
        }
    });

    let generation = shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let replaced = shared
        .extension
        .write()
        .await
        .replace(ActiveLink {
            tx: tx.clone(),
            generation,
        })
        .is_some();
    if replaced {
        shared.router.clear_link().await;
        let _ = shared.events.send(TransportEvent::ExtensionDisconnected);
        broadcast(&shared, Request::notification(mux::EXTENSION_DISCONNECTED, None));
    }
    shared.router.set_link(tx.clone(), LinkKind::Extension).await;
    *shared.identity.write().await = Some(identity.clone());
    let _ = shared.events.send(TransportEvent::ExtensionConnected {
        identity: identity.clone(),
    });
    broadcast(
        &shared,
        Request::notification(
            mux::EXTENSION_CONNECTED,
            serde_json::to_value(&identity).ok(),
        ),
    );

    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Response(response)) => shared.router.handle_response(response),
                    Ok(Frame::Request(request)) if request.is_notification() => {
                        // Followers see every extension notification; each
                        // server keeps only what concerns its own sessions.
                        broadcast(&shared, request.clone());
                        let _ = shared.events.send(TransportEvent::Notification {
                            method: request.method,
                            params: request.params,
                        });
                    }
                    Ok(Frame::Request(request)) => {
                        warn!(method = %request.method, "Unexpected extension request dropped");
                    }
                    Err(e) => warn!("Unparseable extension frame dropped: {}", e),
                },
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

    writer.abort();
    let mut current = shared.extension.write().await;
    let still_current = current
        .as_ref()
        .is_some_and(|link| link.generation == generation);
    if still_current {
        current.take();
        drop(current);
        shared.identity.write().await.take();
        shared.router.clear_link().await;
        let _ = shared.events.send(TransportEvent::ExtensionDisconnected);
        broadcast(&shared, Request::notification(mux::EXTENSION_DISCONNECTED, None));
        info!("Extension disconnected (leader)");
    }
}

/// Follower lifecycle on a leader: register as an additional session,
/// proxy its commands to the extension, relay responses back.
async fn handle_follower_peer(
    shared: Arc<MuxShared>,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    client_id: String,
) {
    if let Err(e) = shared.sessions.create_follower(&client_id) {
        warn!(client_id = %client_id, "Rejecting follower: {}", e);
        let denial = Request::notification(mux::DENIED, Some(json!({ "reason": e.to_string() })));
        if let Ok(text) = serde_json::to_string(&denial) {
            let _ = ws_sink.send(Message::Text(text.into())).await;
        }
        let _ = ws_sink.close().await;
        return;
    }
    info!(client_id = %client_id, "Follower joined");
    let _ = shared.events.send(TransportEvent::FollowerJoined {
        client_id: client_id.clone(),
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    shared.followers.insert(client_id.clone(), tx.clone());

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
                break;
            }
        }
    });

    // A follower that joins mid-session still needs the current link
    // state to leave `active`.
    if let Some(identity) = shared.identity.read().await.clone() {
        let _ = tx.send(Frame::Request(Request::notification(
            mux::EXTENSION_CONNECTED,
            serde_json::to_value(&identity).ok(),
        )));
    }

    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Request(request)) if request.is_notification() => {
                        relay_follower_notification(&shared, request).await;
                    }
                    Ok(Frame::Request(request)) => {
                        proxy_command(&shared, &client_id, request, &tx);
                    }
                    Ok(Frame::Response(_)) => {}
                    Err(e) => warn!("Unparseable follower frame dropped: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Follower socket error: {}", e);
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

    writer.abort();
    shared.followers.remove(&client_id);
    shared.sessions.remove(&client_id);
    let _ = shared.events.send(TransportEvent::FollowerLeft {
        client_id: client_id.clone(),
    });
    info!(client_id = %client_id, "Follower left");
}

/// Dispatches one proxied command on behalf of a follower and ships the
/// correlated response back on the follower's queue.
fn proxy_command(
    shared: &Arc<MuxShared>,
    client_id: &str,
    request: Request,
    reply: &mpsc::UnboundedSender<Frame>,
) {
    let shared = shared.clone();
    let client_id = client_id.to_string();
    let reply = reply.clone();
    tokio::spawn(async move {
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        let outcome = match leader_acl_check(&shared.sessions, &client_id, &request) {
            Err(err) => Err(err),
            Ok(()) => {
                shared
                    .router
                    .dispatch(&request.method, request.params.clone(), HEAVY_DEADLINE)
                    .await
            }
        };
        let response = match outcome {
            Ok(result) => {
                record_follower_tab(&shared.sessions, &client_id, &request.method, &result);
                Response::ok(id, result)
            }
            Err(err) => Response::err(id, err.to_rpc_error()),
        };
        let _ = reply.send(Frame::Response(response));
    });
}

/// Cross-session isolation at the leader: a follower may not address a
/// tab another session owns. The follower's own registry has already
/// applied the strict ownership rule for its agent before proxying; a
/// tab the leader has never seen is recorded against that follower so
/// later cross-follower references are denied. A fresh leader re-learns
/// ownership this way after promotion (ACL state does not transfer).
fn leader_acl_check(
    sessions: &SessionRegistry,
    client_id: &str,
    request: &Request,
) -> crate::error::Result<()> {
    let tab = request
        .params
        .as_ref()
        .and_then(|p| p.get("tab_id"))
        .and_then(|v| v.as_i64());
    if let Some(tab) = tab {
        match sessions.owner_of(tab) {
            Some(owner) if owner != client_id => {
                return Err(BridgeError::PermissionDenied(format!(
                    "session \"{}\" does not own tab {}",
                    client_id, tab
                )));
            }
            Some(_) => {}
            None => sessions.assign_tab(client_id, tab),
        }
    }
    Ok(())
}

/// Tabs created through a follower's commands belong to that follower.
fn record_follower_tab(
    sessions: &SessionRegistry,
    client_id: &str,
    method: &str,
    result: &serde_json::Value,
) {
    if method != commands::CREATE_TAB && method != commands::SELECT_TAB {
        return;
    }
    let id = result
        .get("id")
        .or_else(|| result.get("tab").and_then(|t| t.get("id")))
        .and_then(|v| v.as_i64());
    if let Some(id) = id {
        sessions.assign_tab(client_id, id);
    }
}

/// Follower → extension notification relay. Only the whitelist push is
/// meaningful to forward; everything else is a follower-local concern.
async fn relay_follower_notification(shared: &Arc<MuxShared>, request: Request) {
    if request.method == commands::UPDATE_WHITELIST {
        if let Some(link) = shared.extension.read().await.as_ref() {
            let _ = link.tx.send(request);
        }
    }
}

fn broadcast(shared: &Arc<MuxShared>, notification: Request) {
    for entry in shared.followers.iter() {
        let _ = entry.value().send(Frame::Request(notification.clone()));
    }
}

// ─── Follower Mode ──────────────────────────────────────────────

/// Connects out to the leader and proxies until the link drops or the
/// transport shuts down. Returning hands control back to the promotion
/// loop.
async fn run_follower(shared: &Arc<MuxShared>, shutdown: &mut watch::Receiver<bool>) {
    let url = format!("ws://127.0.0.1:{}/ws", shared.port);
    let ws = match connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Follower connect failed: {}", e);
            tokio::time::sleep(RETRY_DELAY).await;
            return;
        }
    };
    info!("Multiplexer: following leader on port {}", shared.port);

    let (mut ws_sink, mut ws_stream) = ws.split();
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
            if ws_sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(Request::notification(
        handshake::MUX_HELLO,
        Some(json!({ "client_id": shared.client_id })),
    ));
    shared.router.set_link(tx.clone(), LinkKind::Leader).await;

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => handle_leader_frame(shared, &text),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Leader link error: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    writer.abort();
    shared.router.clear_link().await;
    let _ = shared.events.send(TransportEvent::LeaderLost);
    warn!("Leader connection lost");
}

fn handle_leader_frame(shared: &Arc<MuxShared>, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Response(response)) => shared.router.handle_response(response),
        Ok(Frame::Request(request)) if request.is_notification() => {
            match request.method.as_str() {
                mux::EXTENSION_CONNECTED => {
                    let identity: Option<bridge_protocol::ExtensionIdentity> = request
                        .params
                        .and_then(|p| serde_json::from_value(p).ok());
                    if let Some(identity) = identity {
                        let _ = shared
                            .events
                            .send(TransportEvent::ExtensionConnected { identity });
                    }
                }
                mux::EXTENSION_DISCONNECTED => {
                    let _ = shared.events.send(TransportEvent::ExtensionDisconnected);
                }
                mux::DENIED => {
                    error!("Leader rejected this follower: {:?}", request.params);
                }
                _ => {
                    let _ = shared.events.send(TransportEvent::Notification {
                        method: request.method,
                        params: request.params,
                    });
                }
            }
        }
        Ok(Frame::Request(request)) => {
            warn!(method = %request.method, "Unexpected leader request dropped");
        }
        Err(e) => warn!("Unparseable leader frame dropped: {}", e),
    }
}

async fn first_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => return Some(text.to_string()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}
