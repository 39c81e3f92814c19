//! Multiplexer tests: two in-process servers sharing one port, a fake
//! extension on the other side, and a leader-death promotion.

mod common;

use std::time::Duration;

use bridge_server::connection::LinkState;
use bridge_server::error::BridgeError;
use bridge_server::tools;
use common::{next_port, test_connection, wait_for_state, FakeExtension};
use serde_json::json;

async fn enable_mux(
    conn: &std::sync::Arc<bridge_server::connection::Connection>,
    client_id: &str,
) {
    tools::dispatch(
        conn,
        "experiment",
        Some(json!({ "name": "multiplexer", "enabled": true })),
    )
    .await
    .unwrap();
    tools::dispatch(conn, "enable", Some(json!({ "client_id": client_id })))
        .await
        .unwrap();
}

#[tokio::test]
async fn follower_proxies_through_the_leader_and_promotes_on_its_death() {
    let port = next_port();

    // First server binds the port and leads.
    let leader = test_connection(port);
    enable_mux(&leader, "A").await;

    // Second server finds the port taken and follows.
    let follower = test_connection(port);
    enable_mux(&follower, "B").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The extension connects to whoever owns the port; both servers see
    // the link come up (the follower via the leader's relay).
    let mut ext = FakeExtension::connect(port).await;
    wait_for_state(&leader, LinkState::Connected).await;
    wait_for_state(&follower, LinkState::Connected).await;

    // ── Proxied command ──
    // The follower's tab creation travels follower → leader → extension.
    let f = follower.clone();
    let create = tokio::spawn(async move {
        tools::dispatch(&f, "browser_new_tab", Some(json!({}))).await
    });
    let cmd = ext.next_command().await;
    assert_eq!(cmd.method, "createTab");
    ext.respond(cmd.id.unwrap(), json!({ "id": 3, "index": 0 }))
        .await;
    create.await.unwrap().unwrap();

    // Ownership is tracked on both sides of the proxy.
    assert!(follower.sessions.check_owns("B", 3).is_ok());
    assert_eq!(leader.sessions.owner_of(3), Some("B".to_string()));

    // The leader's own agent cannot reach the follower's tab.
    let err = tools::dispatch(
        &leader,
        "browser_navigate",
        Some(json!({ "tab_id": 3, "url": "https://example.com" })),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BridgeError::PermissionDenied(_)));

    // ── Promotion ──
    // Leader death fails the follower's link; after the jittered rebind
    // race the follower owns the port and the extension reconnects.
    tools::dispatch(&leader, "disable", None).await.unwrap();
    wait_for_state(&leader, LinkState::Passive).await;
    wait_for_state(&follower, LinkState::Active).await;

    let mut ext = FakeExtension::connect(port).await;
    wait_for_state(&follower, LinkState::Connected).await;

    // The promoted follower now serves the extension directly.
    let f = follower.clone();
    let snap = tokio::spawn(async move {
        tools::dispatch(&f, "browser_snapshot", Some(json!({ "tab_id": 3 }))).await
    });
    let cmd = ext.next_command().await;
    assert_eq!(cmd.method, "snapshot");
    ext.respond(cmd.id.unwrap(), json!({ "nodes": [] })).await;
    snap.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_follower_identifiers_are_rejected() {
    let port = next_port();

    let leader = test_connection(port);
    enable_mux(&leader, "A").await;

    // A follower presenting the leader's own identifier is turned away;
    // the leader's session registry is undisturbed.
    let follower = test_connection(port);
    enable_mux(&follower, "A").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(leader.sessions.contains("A"));
    assert_eq!(leader.sessions.len(), 1);
}
