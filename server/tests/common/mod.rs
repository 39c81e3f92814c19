//! Shared harness for integration tests: a connection factory with
//! per-test ports, and a fake extension speaking the real WebSocket
//! protocol against the server's endpoint.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_protocol::{Frame, Request, Response};
use bridge_server::connection::{self, Connection, ConnectionConfig, LinkState};
use bridge_server::whitelist::Whitelist;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

static NEXT_PORT: AtomicU16 = AtomicU16::new(18240);

pub fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

/// A passive connection with its event loop running, on its own port.
pub fn test_connection(port: u16) -> Arc<Connection> {
    let config = ConnectionConfig {
        port,
        debug: false,
        no_truncate: false,
        script_mode: true,
    };
    let whitelist = Whitelist::new(std::env::temp_dir().join("bridge-test-whitelist.json"), None);
    let (conn, events) = Connection::new(config, whitelist);
    tokio::spawn(connection::run_events(conn.clone(), events));
    conn
}

/// Polls the connection until it reaches `state`, panicking after ~10 s.
pub async fn wait_for_state(conn: &Arc<Connection>, state: LinkState) {
    for _ in 0..200 {
        if conn.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for state {}", state);
}

/// Scripted stand-in for the browser extension.
pub struct FakeExtension {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FakeExtension {
    /// Connects to the server's WebSocket endpoint (retrying while it
    /// comes up) and performs the identity handshake.
    pub async fn connect(port: u16) -> Self {
        let url = format!("ws://127.0.0.1:{}/ws", port);
        let mut attempts = 0;
        let ws = loop {
            match connect_async(&url).await {
                Ok((ws, _)) => break ws,
                Err(_) => {
                    attempts += 1;
                    assert!(attempts < 200, "endpoint never came up on port {}", port);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        let mut ext = Self { ws };
        ext.send(&Request::notification(
            "register",
            Some(json!({
                "browser_name": "Chrome",
                "version": "139.0",
                "build_timestamp": "2026-07-01T00:00:00Z",
            })),
        ))
        .await;
        ext
    }

    pub async fn send<T: serde::Serialize>(&mut self, frame: &T) {
        let text = serde_json::to_string(frame).unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn next_frame(&mut self) -> Request {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("no frame within 10s")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = msg {
                if let Ok(Frame::Request(request)) = serde_json::from_str::<Frame>(&text) {
                    return request;
                }
            }
        }
    }

    /// Next correlated command, skipping notifications.
    pub async fn next_command(&mut self) -> Request {
        loop {
            let request = self.next_frame().await;
            if !request.is_notification() {
                return request;
            }
        }
    }

    /// Reads frames until the named notification arrives.
    pub async fn expect_notification(&mut self, method: &str) -> Option<Value> {
        loop {
            let request = self.next_frame().await;
            if request.is_notification() && request.method == method {
                return request.params;
            }
        }
    }

    pub async fn respond(&mut self, id: Value, result: Value) {
        self.send(&Response::ok(id, result)).await;
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
