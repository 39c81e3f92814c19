//! # Request Router
//!
//! Correlates extension-bound commands with their responses. Every
//! dispatch gets a fresh identifier from a monotonic counter (never
//! reused for the life of the Connection), a pending-table entry, and a
//! deadline. Responses complete the matching entry; responses with no
//! match are dropped with a warning — usually a late reply to a call
//! that already timed out.
//!
//! The pending entry is registered *before* the frame is handed to the
//! outbound queue, so a fast response cannot race its own registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bridge_protocol::{Request, Response, RpcError};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

use crate::error::{BridgeError, Result};

/// Default per-call deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for CDP-heavy calls (screenshots, raw CDP, navigation waits).
pub const HEAVY_DEADLINE: Duration = Duration::from_secs(45);

/// Outbound queue to the current extension (or leader) link. Mirrors the
/// per-client sender the transport writer task drains.
pub type CommandTx = mpsc::UnboundedSender<Request>;

/// What the router's link points at, which decides how in-flight
/// requests fail when the link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Directly connected to the extension.
    Extension,
    /// Proxying through a leader server.
    Leader,
}

impl LinkKind {
    fn gone_error(self) -> BridgeError {
        match self {
            LinkKind::Extension => BridgeError::TransportGone,
            LinkKind::Leader => BridgeError::LeaderLost,
        }
    }
}

struct PendingEntry {
    complete: oneshot::Sender<Result<Value>>,
}

pub struct Router {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingEntry>,
    link: RwLock<Option<(CommandTx, LinkKind)>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            link: RwLock::new(None),
        }
    }

    /// Installs the outbound queue for a freshly established link.
    pub async fn set_link(&self, tx: CommandTx, kind: LinkKind) {
        *self.link.write().await = Some((tx, kind));
    }

    /// Drops the link and fails every in-flight request with the kind's
    /// loss error. Entries whose callers already gave up are ignored.
    pub async fn clear_link(&self) {
        let kind = match self.link.write().await.take() {
            Some((_, kind)) => kind,
            None => return,
        };
        self.fail_all(kind.gone_error());
    }

    fn fail_all(&self, err: BridgeError) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.complete.send(Err(err.clone()));
            }
        }
    }

    /// Number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// The current outbound queue, for fire-and-forget notifications
    /// that ride the same link as correlated requests.
    pub async fn peek_link(&self) -> Option<CommandTx> {
        self.link.read().await.as_ref().map(|(tx, _)| tx.clone())
    }

    /// Sends `method` to the extension and awaits the correlated
    /// response, up to `deadline`.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let (tx, kind) = match self.link.read().await.as_ref() {
            Some((tx, kind)) => (tx.clone(), *kind),
            None => return Err(BridgeError::TransportGone),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (complete, completed) = oneshot::channel();
        self.pending.insert(id, PendingEntry { complete });

        if tx.send(Request::new(id, method, params)).is_err() {
            self.pending.remove(&id);
            return Err(kind.gone_error());
        }

        match tokio::time::timeout(deadline, completed).await {
            Ok(Ok(result)) => result,
            // Completion sender dropped: the link was torn down between
            // registration and resolution.
            Ok(Err(_)) => Err(kind.gone_error()),
            Err(_) => {
                self.pending.remove(&id);
                Err(BridgeError::Timeout(deadline))
            }
        }
    }

    /// Routes an inbound response frame to its pending entry.
    pub fn handle_response(&self, response: Response) {
        let id = match response.id.as_u64() {
            Some(id) => id,
            None => {
                warn!(id = %response.id, "Response with non-numeric id dropped");
                return;
            }
        };
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let outcome = match response.error {
                    Some(err) => Err(map_extension_error(err)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = entry.complete.send(outcome);
            }
            None => {
                warn!(id, "Unmatched response dropped (late reply after timeout?)");
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifts an extension error envelope into a bridge error, honoring the
/// kind marker when the extension supplies one.
fn map_extension_error(err: RpcError) -> BridgeError {
    let kind = err
        .data
        .as_ref()
        .and_then(|d| d.get("kind"))
        .and_then(|k| k.as_str())
        .unwrap_or("");
    match kind {
        "BlockedApi" => BridgeError::BlockedApi(err.message),
        "WhitelistViolation" => BridgeError::WhitelistViolation(err.message),
        "SelectorNotFound" => BridgeError::ExtensionError(format!("selector not found: {}", err.message)),
        _ => BridgeError::ExtensionError(err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn router_with_link() -> (Router, mpsc::UnboundedReceiver<Request>) {
        let router = Router::new();
        let (tx, rx) = mpsc::unbounded_channel();
        router.set_link(tx, LinkKind::Extension).await;
        (router, rx)
    }

    #[tokio::test]
    async fn responses_correlate_by_id() {
        let (router, mut rx) = router_with_link().await;
        let router = std::sync::Arc::new(router);

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.dispatch("getTabs", None, Duration::from_secs(5)).await
        });

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.method, "getTabs");
        let id = sent.id.unwrap();
        router.handle_response(Response::ok(id, json!({"tabs": [1]})));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["tabs"][0], 1);
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_complete_the_right_callers() {
        let (router, mut rx) = router_with_link().await;
        let router = std::sync::Arc::new(router);

        let r1 = router.clone();
        let first = tokio::spawn(async move {
            r1.dispatch("screenshot", None, Duration::from_secs(5)).await
        });
        let a = rx.recv().await.unwrap();
        let r2 = router.clone();
        let second = tokio::spawn(async move {
            r2.dispatch("getTabs", None, Duration::from_secs(5)).await
        });
        let b = rx.recv().await.unwrap();

        // Reply to the second dispatch first.
        router.handle_response(Response::ok(b.id.unwrap(), json!("tabs")));
        router.handle_response(Response::ok(a.id.unwrap(), json!("pixels")));

        assert_eq!(first.await.unwrap().unwrap(), json!("pixels"));
        assert_eq!(second.await.unwrap().unwrap(), json!("tabs"));
    }

    #[tokio::test]
    async fn deadline_expiry_times_out_and_removes_the_entry() {
        let (router, _rx) = router_with_link().await;
        let err = router
            .dispatch("screenshot", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn late_responses_are_dropped_silently() {
        let (router, mut rx) = router_with_link().await;
        let _ = router
            .dispatch("screenshot", None, Duration::from_millis(20))
            .await;
        let sent = rx.recv().await.unwrap();
        // Arrives after the timeout: must not panic or resurrect state.
        router.handle_response(Response::ok(sent.id.unwrap(), json!(1)));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn dispatch_without_a_link_is_transport_gone() {
        let router = Router::new();
        let err = router
            .dispatch("getTabs", None, DEFAULT_DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportGone));
    }

    #[tokio::test]
    async fn link_loss_fails_pending_with_the_link_kind() {
        let router = std::sync::Arc::new(Router::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        router.set_link(tx, LinkKind::Leader).await;

        let r = router.clone();
        let call = tokio::spawn(async move {
            r.dispatch("navigate", None, Duration::from_secs(5)).await
        });
        // Let the dispatch register itself before dropping the link.
        tokio::time::sleep(Duration::from_millis(10)).await;
        router.clear_link().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::LeaderLost));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn identifiers_are_never_reused() {
        let (router, mut rx) = router_with_link().await;
        let router = std::sync::Arc::new(router);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let r = router.clone();
            let call = tokio::spawn(async move {
                r.dispatch("getTabs", None, Duration::from_secs(1)).await
            });
            let sent = rx.recv().await.unwrap();
            let id = sent.id.clone().unwrap().as_u64().unwrap();
            assert!(seen.insert(id), "id {} reused", id);
            router.handle_response(Response::ok(sent.id.unwrap(), json!(null)));
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn extension_errors_carry_their_kind() {
        let (router, mut rx) = router_with_link().await;
        let router = std::sync::Arc::new(router);
        let r = router.clone();
        let call = tokio::spawn(async move {
            r.dispatch("evaluate", None, Duration::from_secs(5)).await
        });
        let sent = rx.recv().await.unwrap();
        let mut err = RpcError::new(-32010, "fetch is blocked");
        err.data = Some(json!({"kind": "BlockedApi"}));
        router.handle_response(Response::err(sent.id.unwrap(), err));
        assert!(matches!(
            call.await.unwrap().unwrap_err(),
            BridgeError::BlockedApi(_)
        ));
    }
}
