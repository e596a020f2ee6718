//! Scripted fake server for driving a real `Client` over the in-process
//! transport.

#![allow(dead_code)]

use std::time::Duration;

use aerolink_client::backoff::BackoffConfig;
use aerolink_client::{memory_pair, Client, ClientConfig, MemoryListener, MemoryPeer};
use aerolink_protocol::{RequestId, RpcErrorPayload, WireMessage, PROTOCOL_VERSION};
use serde_json::{json, Value};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> ClientConfig {
    ClientConfig {
        url: "memory://fake".to_string(),
        connect_timeout_ms: 1_000,
        handshake_timeout_ms: 1_000,
        request_timeout_ms: Some(5_000),
        heartbeat_interval_ms: None,
        backoff: BackoffConfig {
            initial_ms: 10,
            max_ms: 50,
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..ClientConfig::default()
    }
}

pub struct FakeServer {
    listener: MemoryListener,
}

impl FakeServer {
    pub fn new(listener: MemoryListener) -> Self {
        Self { listener }
    }

    pub async fn accept(&mut self) -> ServerConn {
        let peer = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("client connects in time")
            .expect("listener open");
        ServerConn { peer }
    }

    /// Accept the next link and answer its `initialize`.
    pub async fn accept_handshake(&mut self) -> ServerConn {
        let mut conn = self.accept().await;
        conn.answer_handshake().await;
        conn
    }
}

/// Server end of one client link.
pub struct ServerConn {
    peer: MemoryPeer,
}

impl ServerConn {
    pub async fn answer_handshake(&mut self) {
        let (id, params) = self.expect_request("initialize").await;
        assert_eq!(params["protocol_version"], PROTOCOL_VERSION);
        assert_eq!(params["capabilities"]["permissions"], true);
        self.respond(
            id,
            json!({
                "protocol_version": PROTOCOL_VERSION,
                "server_info": {"name": "fake-server", "version": "0.0.0"},
                "capabilities": {"resume_session": true, "fork_session": true, "files": true, "terminals": true}
            }),
        );
    }

    pub async fn next_message(&mut self) -> WireMessage {
        let frame = tokio::time::timeout(WAIT, self.peer.recv())
            .await
            .expect("frame in time")
            .expect("client link open");
        WireMessage::decode(&frame).expect("client sent a valid frame")
    }

    pub async fn expect_request(&mut self, method: &str) -> (RequestId, Value) {
        match self.next_message().await {
            WireMessage::Request {
                id,
                method: actual,
                params,
            } => {
                assert_eq!(actual, method, "unexpected request");
                (id, params)
            }
            other => panic!("expected {method} request, got {:?}", other),
        }
    }

    pub async fn expect_response(&mut self, id: RequestId) -> Result<Value, RpcErrorPayload> {
        match self.next_message().await {
            WireMessage::Response {
                id: actual,
                result,
                error,
            } => {
                assert_eq!(actual, id, "response for the wrong request");
                match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                }
            }
            other => panic!("expected response to {id}, got {:?}", other),
        }
    }

    /// Assert the client sends nothing for `duration`.
    pub async fn assert_silent(&mut self, duration: Duration) {
        if let Ok(frame) = tokio::time::timeout(duration, self.peer.recv()).await {
            panic!("expected silence, client sent {:?}", frame);
        }
    }

    /// Wait until the client closes the link.
    pub async fn closed(&mut self) {
        loop {
            let frame = tokio::time::timeout(WAIT, self.peer.recv())
                .await
                .expect("client closes in time");
            if frame.is_none() {
                return;
            }
        }
    }

    pub fn respond(&self, id: RequestId, result: Value) {
        self.send(WireMessage::success(id, result));
    }

    pub fn respond_error(&self, id: RequestId, code: i64, message: &str) {
        self.send(WireMessage::failure(id, RpcErrorPayload::new(code, message)));
    }

    pub fn notify(&self, topic: &str, payload: Value) {
        self.send(WireMessage::notification(topic, payload).expect("notification"));
    }

    pub fn request(&self, id: RequestId, method: &str, params: Value) {
        self.send(WireMessage::request(id, method, params).expect("request"));
    }

    fn send(&self, message: WireMessage) {
        assert!(
            self.peer.send(message.encode().expect("encode")),
            "client link closed"
        );
    }
}

/// A connected client plus the server side of its link.
pub async fn connected_client() -> (Client, FakeServer, ServerConn) {
    connected_client_with(test_config()).await
}

pub async fn connected_client_with(config: ClientConfig) -> (Client, FakeServer, ServerConn) {
    let (connector, listener) = memory_pair();
    let client = Client::with_connector(config, connector).expect("client");
    let mut server = FakeServer::new(listener);
    let (connected, conn) = tokio::join!(client.connect(), server.accept_handshake());
    connected.expect("connect");
    (client, server, conn)
}

/// Subscribe `client` to `session_id`, answering with `state`.
pub async fn subscribe(client: &Client, conn: &mut ServerConn, session_id: &str, state: Value) {
    let script = async {
        let (id, params) = conn.expect_request("subscribe_session").await;
        assert_eq!(params["session_id"], session_id);
        conn.respond(id, state);
    };
    let (subscription, ()) = tokio::join!(client.subscribe_session(session_id), script);
    subscription.expect("subscribe");
}

pub fn empty_state(session_id: &str) -> Value {
    json!({"session_id": session_id, "chat_items": []})
}

pub fn message_item(id: &str, role: &str, content: &str) -> Value {
    json!({
        "kind": "message",
        "id": id,
        "role": role,
        "content": content,
        "timestamp": 1_700_000_000_000i64
    })
}

pub fn session_update(session_id: &str, update: Value) -> Value {
    json!({"session_id": session_id, "update": update})
}

pub fn permission_params(session_id: &str) -> Value {
    json!({
        "session_id": session_id,
        "tool_call": {"id": "call-1", "title": "rm -rf target", "kind": "execute", "status": "pending"},
        "options": [
            {"option_id": "allow", "name": "Allow once", "kind": "allow_once"},
            {"option_id": "reject", "name": "Reject", "kind": "reject_once"}
        ]
    })
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
