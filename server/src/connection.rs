//! # Connection
//!
//! The process-wide runtime object: the `passive → active → connected`
//! state machine, the live transport, the session registry, and the
//! event loop that reacts to extension link changes. Created once at
//! startup in `passive` and never destroyed before process exit.
//!
//! Locks are taken briefly for lookups and transitions; the event loop
//! never holds a registry entry across an await point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bridge_protocol::{commands, ExtensionIdentity, Request, TabInfo};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::experiments::{Experiment, ExperimentRegistry};
use crate::router::{Router, DEFAULT_DEADLINE};
use crate::sessions::SessionRegistry;
use crate::status::{format_header, StatusInputs};
use crate::transport::{
    EventRx, EventTx, MuxTransport, SingleTransport, Transport, TransportEvent,
};
use crate::whitelist::Whitelist;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Console payloads forwarded to the agent are clipped to this many
/// characters unless `--debug=no_truncate` is set.
const CONSOLE_TRUNCATE: usize = 500;

/// The connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Not enabled; only connection-management tools work.
    #[default]
    Passive,
    /// Enabled and listening, no extension linked yet.
    Active,
    /// Extension linked; tab-scoped tools are live.
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Passive => "passive",
            LinkState::Active => "active",
            LinkState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub port: u16,
    pub debug: bool,
    pub no_truncate: bool,
    pub script_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: 5555,
            debug: false,
            no_truncate: false,
            script_mode: false,
        }
    }
}

pub struct Connection {
    pub config: ConnectionConfig,
    pub router: Arc<Router>,
    pub sessions: SessionRegistry,
    pub experiments: ExperimentRegistry,
    pub whitelist: Arc<Whitelist>,
    state: RwLock<LinkState>,
    transport: RwLock<Option<Transport>>,
    browser: RwLock<Option<ExtensionIdentity>>,
    /// The enabling agent's session id — the invoker of everything that
    /// arrives on this process's stdio channel.
    primary: RwLock<Option<String>>,
    /// Outbound notifications to the agent channel.
    notifier: RwLock<Option<mpsc::UnboundedSender<Request>>>,
    events_tx: EventTx,
    http: reqwest::Client,
}

impl Connection {
    /// Builds the connection in `passive`. The returned receiver feeds
    /// [`run_events`]; keeping it external lets tests drive the loop.
    pub fn new(config: ConnectionConfig, whitelist: Whitelist) -> (Arc<Self>, EventRx) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            config,
            router: Arc::new(Router::new()),
            sessions: SessionRegistry::new(),
            experiments: ExperimentRegistry::from_env(),
            whitelist: Arc::new(whitelist),
            state: RwLock::new(LinkState::Passive),
            transport: RwLock::new(None),
            browser: RwLock::new(None),
            primary: RwLock::new(None),
            notifier: RwLock::new(None),
            events_tx,
            http: reqwest::Client::new(),
        });
        (conn, events_rx)
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    pub async fn primary_session(&self) -> Option<String> {
        self.primary.read().await.clone()
    }

    /// Installs the agent channel's notification queue.
    pub async fn set_notifier(&self, tx: mpsc::UnboundedSender<Request>) {
        *self.notifier.write().await = Some(tx);
    }

    pub async fn notify_agent(&self, request: Request) {
        if let Some(tx) = self.notifier.read().await.as_ref() {
            let _ = tx.send(request);
        }
    }

    pub async fn notify_tools_changed(&self) {
        self.notify_agent(Request::notification("tools_changed", None))
            .await;
    }

    // ─── State Transitions ──────────────────────────────────────

    /// `enable(client_id)`: validates the identifier, starts the
    /// transport, creates the session. Repeat enables with the same
    /// identifier are idempotent; a different identifier joins as an
    /// additional session or fails `DuplicateSession`. The caller spawns
    /// the session's drift task when the result says "enabled".
    pub async fn enable(
        &self,
        client_id: &str,
        overrides: HashMap<Experiment, bool>,
    ) -> Result<Value> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(BridgeError::InvalidArguments(
                "client_id is required".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if *state != LinkState::Passive {
            let primary = self.primary.read().await.clone();
            if primary.as_deref() == Some(client_id) {
                return Ok(json!({ "status": "already enabled", "client_id": client_id }));
            }
            self.sessions.create(client_id, overrides)?;
            return Ok(json!({ "status": "enabled", "client_id": client_id }));
        }

        self.sessions.create(client_id, overrides)?;
        let transport = match self.start_transport(client_id).await {
            Ok(transport) => transport,
            Err(e) => {
                self.sessions.remove(client_id);
                return Err(e);
            }
        };
        *self.transport.write().await = Some(transport);
        *self.primary.write().await = Some(client_id.to_string());
        *state = LinkState::Active;
        drop(state);

        info!(client_id, port = self.config.port, "Bridge enabled");
        self.notify_tools_changed().await;
        Ok(json!({ "status": "enabled", "client_id": client_id }))
    }

    /// `disable`: tears down the transport, destroys sessions, resets
    /// experiment flags. Idempotent in `passive`.
    pub async fn disable(&self) -> Result<Value> {
        let mut state = self.state.write().await;
        if *state == LinkState::Passive {
            return Ok(json!({ "status": "already disabled" }));
        }

        if let Some(transport) = self.transport.read().await.as_ref() {
            transport
                .send(Request::notification(commands::SESSION_DISCONNECT, None))
                .await;
        }
        if let Some(transport) = self.transport.write().await.take() {
            transport.stop().await;
        }
        self.sessions.clear();
        self.experiments.reset();
        *self.browser.write().await = None;
        *self.primary.write().await = None;
        *state = LinkState::Passive;
        drop(state);

        info!("Bridge disabled");
        self.notify_tools_changed().await;
        Ok(json!({ "status": "disabled" }))
    }

    async fn start_transport(&self, client_id: &str) -> Result<Transport> {
        let events = self.events_tx.clone();
        if self.experiments.is_enabled(Experiment::Multiplexer) {
            Ok(Transport::Mux(MuxTransport::start(
                self.config.port,
                client_id.to_string(),
                self.router.clone(),
                events,
                self.sessions.clone(),
            )))
        } else {
            let transport =
                SingleTransport::start(self.config.port, self.router.clone(), events).await?;
            Ok(Transport::Single(transport))
        }
    }

    /// Fire-and-forget notification to the extension via the live
    /// transport, if any.
    pub async fn send_to_extension(&self, request: Request) {
        if let Some(transport) = self.transport.read().await.as_ref() {
            transport.send(request).await;
        }
    }

    // ─── Status ─────────────────────────────────────────────────

    /// Header prefixed to every tool response, computed for the stdio
    /// agent's session.
    pub async fn header(&self) -> String {
        let state = *self.state.read().await;
        let primary = self.primary.read().await.clone();
        let attached = match primary.as_deref() {
            Some(id) => self.sessions.attached(id),
            None => None,
        };
        let stealth = primary
            .as_deref()
            .map(|id| {
                self.sessions.effective_experiment(
                    id,
                    Experiment::MouseHumanization,
                    &self.experiments,
                )
            })
            .unwrap_or(false);
        let browser_name = self
            .browser
            .read()
            .await
            .as_ref()
            .map(|b| b.browser_name.clone());
        format_header(&StatusInputs {
            state,
            version: VERSION.to_string(),
            debug: self.config.debug,
            browser_name,
            attached_tab: attached,
            stealth,
        })
    }

    /// Body of the `status` tool.
    pub async fn status_payload(&self) -> Value {
        let state = *self.state.read().await;
        let browser = self.browser.read().await.clone();
        json!({
            "state": state.to_string(),
            "version": VERSION,
            "port": self.config.port,
            "debug": self.config.debug,
            "browser": browser.map(|b| json!({
                "name": b.browser_name,
                "version": b.version,
                "build_timestamp": b.build_timestamp,
            })),
            "sessions": self.sessions.client_ids(),
            "experiments": self.experiments.snapshot(),
            "whitelist_configured": self.whitelist.is_configured(),
        })
    }

    // ─── Whitelist ──────────────────────────────────────────────

    async fn push_whitelist(&self, suffixes: Vec<String>) {
        self.send_to_extension(Request::notification(
            commands::UPDATE_WHITELIST,
            Some(json!({ "suffixes": suffixes })),
        ))
        .await;
    }

    async fn dispatch_idle_drift(&self, client_id: &str) {
        let viewport = match self
            .router
            .dispatch(commands::GET_VIEWPORT_DIMENSIONS, None, DEFAULT_DEADLINE)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                debug!("Idle drift skipped, no viewport: {}", e);
                return;
            }
        };
        let Some(viewport) = parse_viewport(&viewport) else {
            return;
        };
        let Some(waypoint) = self
            .sessions
            .with_mouse(client_id, |m| m.idle_drift(viewport))
        else {
            return;
        };
        let params = json!({ "waypoints": [waypoint] });
        if let Err(e) = self
            .router
            .dispatch(commands::HUMANIZED_MOUSE_MOVE, Some(params), DEFAULT_DEADLINE)
            .await
        {
            debug!("Idle drift dispatch failed: {}", e);
        }
    }
}

// ─── Background Tasks ───────────────────────────────────────────

/// Daily-cadence whitelist refresher. Spawned once at startup; the
/// whitelist is independent of the enable/disable cycle.
pub fn spawn_whitelist_refresher(conn: &Arc<Connection>) {
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.whitelist.load_cache().await;
        loop {
            match conn.whitelist.refresh_if_due(&conn.http).await {
                Ok(Some(suffixes)) => conn.push_whitelist(suffixes).await,
                Ok(None) => {}
                Err(e) => warn!("Whitelist refresh failed: {}", e),
            }
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    });
}

/// Background cadence of small idle mouse movements for one session,
/// active while humanization is effective and the extension is linked.
/// Ends when the session is destroyed.
pub fn spawn_drift_task(conn: &Arc<Connection>, client_id: &str) {
    let conn = conn.clone();
    let client_id = client_id.to_string();
    tokio::spawn(async move {
        loop {
            if !conn.sessions.contains(&client_id) {
                break;
            }
            if !conn.sessions.effective_experiment(
                &client_id,
                Experiment::MouseHumanization,
                &conn.experiments,
            ) {
                tokio::time::sleep(std::time::Duration::from_secs(15)).await;
                continue;
            }
            let Some(interval) = conn
                .sessions
                .with_mouse(&client_id, |m| m.drift_interval())
            else {
                break;
            };
            tokio::time::sleep(interval).await;

            if !conn.sessions.contains(&client_id) {
                break;
            }
            if *conn.state.read().await != LinkState::Connected {
                continue;
            }
            let idle = conn.sessions.idle_for(&client_id).unwrap_or_default();
            if idle < interval {
                continue; // the session was busy; skip this tick
            }
            conn.dispatch_idle_drift(&client_id).await;
        }
    });
}

pub fn parse_viewport(value: &Value) -> Option<(u32, u32)> {
    let width = value.get("width")?.as_u64()?;
    let height = value.get("height")?.as_u64()?;
    Some((width as u32, height as u32))
}

// ─── Transport Event Loop ───────────────────────────────────────

/// Drains transport events and drives the state machine. Spawned once;
/// runs for the life of the process.
pub async fn run_events(conn: Arc<Connection>, mut events: EventRx) {
    while let Some(event) = events.recv().await {
        handle_event(&conn, event).await;
    }
}

async fn handle_event(conn: &Arc<Connection>, event: TransportEvent) {
    match event {
        TransportEvent::ExtensionConnected { identity } => {
            info!(
                browser = %identity.browser_name,
                version = %identity.version,
                "Extension link up"
            );
            *conn.browser.write().await = Some(identity);
            {
                let mut state = conn.state.write().await;
                if *state != LinkState::Passive {
                    *state = LinkState::Connected;
                }
            }
            complete_handshake(conn).await;
        }
        TransportEvent::ExtensionDisconnected => {
            // Soft event: tab ownership is kept, extension-side ids are
            // stale until the next link.
            *conn.browser.write().await = None;
            conn.sessions.mark_tabs_stale();
            let mut state = conn.state.write().await;
            if *state == LinkState::Connected {
                *state = LinkState::Active;
            }
            drop(state);
            info!("Extension link down");
        }
        TransportEvent::LeaderLost => {
            let mut state = conn.state.write().await;
            if *state == LinkState::Connected {
                *state = LinkState::Active;
            }
            drop(state);
            warn!("Leader lost; pending calls failed, awaiting promotion");
        }
        TransportEvent::PromotedToLeader => {
            info!("Now the multiplexer leader");
        }
        TransportEvent::FollowerJoined { client_id } => {
            info!(client_id, "Follower session joined");
        }
        TransportEvent::FollowerLeft { client_id } => {
            info!(client_id, "Follower session left");
        }
        TransportEvent::Notification { method, params } => {
            handle_extension_notification(conn, &method, params).await;
        }
    }
}

/// Post-handshake pushes: the session identifier, the current
/// whitelist, and the humanization personality when that experiment is
/// effective.
async fn complete_handshake(conn: &Arc<Connection>) {
    let primary = conn.primary.read().await.clone();
    let Some(primary) = primary else { return };

    if let Some(transport) = conn.transport.read().await.as_ref() {
        transport.notify_client_id(&primary).await;
    }
    if let Some(suffixes) = conn.whitelist.suffixes().await {
        conn.push_whitelist(suffixes).await;
    }
    if conn.sessions.effective_experiment(
        &primary,
        Experiment::MouseHumanization,
        &conn.experiments,
    ) {
        let personality = conn.sessions.with_mouse(&primary, |m| m.personality());
        if let Some(p) = personality {
            conn.send_to_extension(Request::notification(
                commands::SET_HUMANIZATION_CONFIG,
                Some(json!({
                    "speed_multiplier": p.speed_multiplier,
                    "overshoot_tendency": p.overshoot_tendency,
                    "curvature_bias": p.curvature_bias,
                    "jitter_px": p.jitter_px,
                })),
            ))
            .await;
        }
    }
}

async fn handle_extension_notification(
    conn: &Arc<Connection>,
    method: &str,
    params: Option<Value>,
) {
    use bridge_protocol::notifications;

    match method {
        notifications::TAB_INFO_UPDATE => {
            let tab = params
                .as_ref()
                .map(|p| p.get("tab").unwrap_or(p))
                .and_then(|p| serde_json::from_value::<TabInfo>(p.clone()).ok());
            let Some(tab) = tab else {
                warn!("Malformed tab_info_update dropped");
                return;
            };
            let owner = conn
                .sessions
                .owner_of(tab.id)
                .or(conn.primary.read().await.clone());
            if let Some(owner) = owner {
                conn.sessions.set_attached(&owner, tab);
            }
        }
        notifications::TECH_STACK => {
            let tech = params
                .as_ref()
                .and_then(|p| p.get("tech_stack").or_else(|| p.get("tech")))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let owner = match params.as_ref().and_then(|p| p.get("tab_id")).and_then(|v| v.as_i64())
            {
                Some(tab) => conn.sessions.owner_of(tab),
                None => conn.primary.read().await.clone(),
            };
            if let (Some(owner), Some(tech)) = (owner, tech) {
                conn.sessions.set_tech_stack(&owner, tech);
            }
        }
        notifications::CONSOLE => {
            let level = params
                .as_ref()
                .and_then(|p| p.get("level"))
                .and_then(|v| v.as_str())
                .unwrap_or("log")
                .to_string();
            let mut text = params
                .as_ref()
                .and_then(|p| p.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if !conn.config.no_truncate && text.chars().count() > CONSOLE_TRUNCATE {
                text = text.chars().take(CONSOLE_TRUNCATE).collect::<String>() + "…";
            }
            conn.notify_agent(Request::notification(
                "log",
                Some(json!({ "level": level, "text": text, "source": "console" })),
            ))
            .await;
        }
        notifications::NAVIGATION_BLOCKED => {
            let url = params
                .as_ref()
                .and_then(|p| p.get("url"))
                .and_then(|v| v.as_str())
                .unwrap_or("<unknown>");
            warn!(url, "Navigation blocked by whitelist");
            conn.notify_agent(Request::notification(
                "log",
                Some(json!({
                    "level": "warn",
                    "text": format!("navigation blocked: {}", url),
                    "source": "whitelist",
                })),
            ))
            .await;
        }
        other => debug!(method = other, "Unhandled extension notification"),
    }
}
