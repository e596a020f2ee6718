//! Connection lifecycle: handshake, heartbeat, reconnect callbacks, teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aerolink_client::backoff::BackoffConfig;
use aerolink_client::{memory_pair, Client, ClientConfig, ClientError, ConnectionState};
use parking_lot::Mutex;

use common::{connected_client, connected_client_with, eventually, test_config, FakeServer};

fn unconnected(config: ClientConfig) -> (Client, FakeServer) {
    let (connector, listener) = memory_pair();
    let client = Client::with_connector(config, connector).expect("client");
    (client, FakeServer::new(listener))
}

#[tokio::test]
async fn unanswered_handshake_times_out() {
    let (client, mut server) = unconnected(ClientConfig {
        handshake_timeout_ms: 100,
        ..test_config()
    });

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut conn = server.accept().await;
    conn.expect_request("initialize").await;

    let err = connecting
        .await
        .expect("join")
        .expect_err("handshake must time out");
    assert!(matches!(err, ClientError::Connection(_)), "{err:?}");

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Error);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("handshake")));
    conn.closed().await;
}

#[tokio::test]
async fn disconnect_during_handshake_ends_disconnected() {
    let (client, mut server) = unconnected(test_config());

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut conn = server.accept().await;
    conn.expect_request("initialize").await;

    client.disconnect().await;

    let err = connecting
        .await
        .expect("join")
        .expect_err("connect must not succeed");
    assert!(matches!(err, ClientError::ShutDown), "{err:?}");
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_error, None);
    conn.closed().await;
}

#[tokio::test]
async fn missed_heartbeat_triggers_reconnect() {
    let (client, mut server, mut conn) = connected_client_with(ClientConfig {
        heartbeat_interval_ms: Some(50),
        heartbeat_timeout_ms: 50,
        backoff: BackoffConfig {
            initial_ms: 200,
            max_ms: 200,
            multiplier: 1.0,
            jitter: 0.0,
        },
        ..test_config()
    })
    .await;
    let mut status = client.watch_status();

    // Never answered.
    conn.expect_request("ping").await;
    conn.closed().await;

    let lost = status
        .wait_for(|status| status.state == ConnectionState::Error)
        .await
        .expect("status")
        .clone();
    assert!(lost
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("heartbeat")));

    let mut conn = server.accept_handshake().await;
    let (ping, _) = conn.expect_request("ping").await;
    conn.respond(ping, serde_json::json!({}));
    eventually("reconnected", || {
        client.status().state == ConnectionState::Connected
    })
    .await;
}

#[tokio::test]
async fn reconnect_callbacks_run_in_order_after_a_successful_handshake() {
    let (client, mut server, conn) = connected_client().await;

    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let _first = client.connection().on_reconnect({
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move { calls.lock().push("first") }
        }
    });
    let _second = client.connection().on_reconnect({
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move { calls.lock().push("second") }
        }
    });

    drop(conn);

    // First attempt: the server rejects the handshake.
    let mut rejected = server.accept().await;
    let (id, _) = rejected.expect_request("initialize").await;
    rejected.respond_error(id, -32603, "warming up");
    rejected.closed().await;

    let mut retry = server.accept().await;
    assert!(calls.lock().is_empty(), "callbacks ran after a failed attempt");
    retry.answer_handshake().await;

    eventually("callbacks ran", || calls.lock().len() == 2).await;
    assert_eq!(*calls.lock(), vec!["first", "second"]);
    assert_eq!(client.status().state, ConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.lock().len(), 2);
}
