//! # Agent Channel
//!
//! Line-delimited JSON-RPC over the process's stdio. Requests are
//! handled one at a time — the agent channel is serialized — while
//! notifications to the agent (catalog changes, log events) ride an
//! outbound queue drained by a writer task, so they interleave cleanly
//! with responses. Logging goes to stderr or a file; stdout carries
//! nothing but frames.

use std::sync::Arc;

use bridge_protocol::{Request, Response, RpcError};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::Connection;
use crate::tools;

/// Processes one inbound line. Returns the serialized response, or
/// `None` for blank lines and notifications.
pub async fn handle_line(conn: &Arc<Connection>, line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let request: Request = match serde_json::from_str(trimmed) {
        Ok(request) => request,
        Err(e) => {
            // No usable id on a parse error; answer with a sentinel.
            let response = Response::err(
                json!(-1),
                RpcError::new(-32700, format!("Parse error: {}", e)),
            );
            return serde_json::to_string(&response).ok();
        }
    };

    let Some(id) = request.id.clone() else {
        debug!(method = %request.method, "Agent notification ignored");
        return None;
    };

    let outcome = tools::dispatch(conn, &request.method, request.params).await;

    // The header reflects the state *after* the call: an `enable`
    // response already shows the enabled connection.
    let header = conn.header().await;
    let response = match outcome {
        Ok(body) => {
            let body_text =
                serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
            Response::ok(id, json!({ "text": format!("{}{}", header, body_text) }))
        }
        Err(err) => {
            let mut rpc = err.to_rpc_error();
            rpc.message = format!("{}{}", header, rpc.message);
            Response::err(id, rpc)
        }
    };
    serde_json::to_string(&response).ok()
}

/// Runs the agent loop until stdin closes. Losing the agent transport
/// ends the process; pending extension work dies with it.
pub async fn run(conn: Arc<Connection>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    // ── Outbound Writer ──
    // Responses and notifications funnel through one queue so frames
    // never interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    // ── Notification Bridge ──
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Request>();
    conn.set_notifier(notify_tx).await;
    let notify_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(note) = notify_rx.recv().await {
            if let Ok(text) = serde_json::to_string(&note) {
                let _ = notify_out.send(text);
            }
        }
    });

    // ── Serialized Request Loop ──
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = handle_line(&conn, &line).await {
            if out_tx.send(response).is_err() {
                break;
            }
        }
    }

    debug!("Agent channel closed");
    Ok(())
}
