//! RPC dispatcher.
//!
//! Owns the current link slot and the pending-request table. Outbound requests
//! get a monotonically increasing ID and a oneshot reply channel; the link's
//! reader task resolves them as responses arrive, in any order. Notifications
//! fan out to topic handlers and server-initiated requests go to method
//! handlers, whose results are written back on the same link.
//!
//! Every inbound frame is stamped with an inbound sequence number so callers
//! can order a fetched baseline against notifications that raced it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use aerolink_protocol::{RequestId, RpcErrorPayload, WireMessage};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::transport::Link;

/// Inbound notification, stamped with its position in the link's frame order.
#[derive(Debug, Clone)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
    pub seq: u64,
}

/// A typed reply plus the inbound sequence number of its response frame.
#[derive(Debug, Clone)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub value: T,
}

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcErrorPayload>> + Send + Sync>;

/// Removes one registered handler or callback.
#[must_use = "keep the Unsubscribe to be able to remove the handler later"]
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Unsubscribe {
    pub(crate) fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(remove)))
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.0.take() {
            remove();
        }
    }
}

/// Returned by [`RpcDispatcher::attach`]; resolves when that link goes away.
pub struct LinkHandle {
    generation: u64,
    closed: oneshot::Receiver<String>,
}

impl LinkHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait until the link is detached, returning the reason.
    pub async fn closed(&mut self) -> String {
        match (&mut self.closed).await {
            Ok(reason) => reason,
            Err(_) => "link dropped".to_string(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Only once the handshake has completed on the current link.
    Ready,
    /// Any attached link, used for the handshake itself.
    Attached,
}

struct LinkSlot {
    generation: u64,
    writer: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    ready: bool,
    closed: Option<oneshot::Sender<String>>,
}

struct PendingRequest {
    method: String,
    issued_at: Instant,
    generation: u64,
    reply: oneshot::Sender<Result<(Value, u64)>>,
}

struct Inner {
    next_id: AtomicU64,
    next_generation: AtomicU64,
    next_handler: AtomicU64,
    inbound_seq: AtomicU64,
    default_timeout: Option<Duration>,
    link: Mutex<Option<LinkSlot>>,
    pending: DashMap<RequestId, PendingRequest>,
    topics: Mutex<HashMap<String, Vec<(u64, NotificationHandler)>>>,
    request_handlers: Mutex<HashMap<String, (u64, RequestHandler)>>,
}

#[derive(Clone)]
pub struct RpcDispatcher {
    inner: Arc<Inner>,
}

impl RpcDispatcher {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                next_handler: AtomicU64::new(1),
                inbound_seq: AtomicU64::new(0),
                default_timeout,
                link: Mutex::new(None),
                pending: DashMap::new(),
                topics: Mutex::new(HashMap::new()),
                request_handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -- Link lifecycle ------------------------------------------------------

    /// Install `link` as the current link, detaching any previous one, and
    /// start its reader and writer tasks. The link only carries public
    /// requests after [`mark_ready`](Self::mark_ready).
    pub fn attach(&self, link: Link) -> LinkHandle {
        self.detach_current("replaced by a new link");

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (writer, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        *self.inner.link.lock() = Some(LinkSlot {
            generation,
            writer,
            cancel: cancel.clone(),
            ready: false,
            closed: Some(closed_tx),
        });

        let Link { sink, stream } = link;
        tokio::spawn(Arc::clone(&self.inner).run_writer(generation, sink, outbound_rx));
        tokio::spawn(Arc::clone(&self.inner).run_reader(generation, stream, cancel));

        debug!(
            component = "rpc",
            event = "rpc.link.attached",
            generation,
            "Link attached"
        );

        LinkHandle {
            generation,
            closed: closed_rx,
        }
    }

    /// Open the gate for public requests on link `generation`.
    pub fn mark_ready(&self, generation: u64) -> bool {
        let mut link = self.inner.link.lock();
        match link.as_mut() {
            Some(slot) if slot.generation == generation => {
                slot.ready = true;
                true
            }
            _ => false,
        }
    }

    /// Tear down link `generation` if it is still current. Pending requests
    /// on it fail with [`ClientError::ConnectionLost`].
    pub fn detach(&self, generation: u64, reason: &str) -> bool {
        self.inner.detach(generation, reason)
    }

    pub fn detach_current(&self, reason: &str) -> bool {
        match self.current_generation() {
            Some(generation) => self.inner.detach(generation, reason),
            None => false,
        }
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.inner.link.lock().as_ref().map(|slot| slot.generation)
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|slot| slot.ready)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // -- Outbound ------------------------------------------------------------

    /// Send a request with the default timeout and decode its result.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.request_with_timeout(method, params, self.inner.default_timeout)
            .await
    }

    /// Like [`request`](Self::request) with an explicit deadline; `None` waits
    /// until the response arrives or the link drops.
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let (value, _seq) = self.call(method, params, timeout, Gate::Ready).await?;
        decode_result(method, value)
    }

    /// Request whose reply also reports the inbound sequence number of the
    /// response frame.
    pub async fn call_sequenced<P, R>(&self, method: &str, params: P) -> Result<Sequenced<R>>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let (value, seq) = self
            .call(method, params, self.inner.default_timeout, Gate::Ready)
            .await?;
        Ok(Sequenced {
            seq,
            value: decode_result(method, value)?,
        })
    }

    /// Request allowed before the link is marked ready.
    pub(crate) async fn handshake<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let (value, _seq) = self
            .call(method, params, Some(timeout), Gate::Attached)
            .await?;
        decode_result(method, value)
    }

    /// Fire-and-forget client notification.
    pub fn notify(&self, topic: &str, payload: impl Serialize) -> Result<()> {
        let frame = WireMessage::notification(topic, payload)
            .and_then(|message| message.encode())
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        let link = self.inner.link.lock();
        match link.as_ref() {
            Some(slot) if slot.ready => slot
                .writer
                .send(frame)
                .map_err(|_| ClientError::ConnectionLost),
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn call<P: Serialize>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
        gate: Gate,
    ) -> Result<(Value, u64)> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = WireMessage::request(id, method, params)
            .and_then(|message| message.encode())
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let link = self.inner.link.lock();
            let slot = match link.as_ref() {
                Some(slot) if slot.ready || gate == Gate::Attached => slot,
                _ => return Err(ClientError::NotConnected),
            };
            self.inner.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    generation: slot.generation,
                    reply: reply_tx,
                },
            );
            if slot.writer.send(frame).is_err() {
                self.inner.pending.remove(&id);
                return Err(ClientError::ConnectionLost);
            }
        }

        // Removes the entry if this future is dropped or times out.
        let _pending = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        component = "rpc",
                        event = "rpc.request.timeout",
                        request_id = id,
                        method = %method,
                        timeout_ms = after.as_millis() as u64,
                        "Request timed out"
                    );
                    return Err(ClientError::Timeout {
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => reply_rx.await,
        };

        outcome.unwrap_or(Err(ClientError::ConnectionLost))
    }

    // -- Handlers ------------------------------------------------------------

    /// Register a handler for notifications on `topic`. Handlers run on the
    /// link's reader task, in registration order, and must not block.
    pub fn on<F>(&self, topic: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handler_id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((handler_id, Arc::new(handler)));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        Unsubscribe::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut topics = inner.topics.lock();
            if let Some(handlers) = topics.get_mut(&topic) {
                handlers.retain(|(id, _)| *id != handler_id);
                if handlers.is_empty() {
                    topics.remove(&topic);
                }
            }
        })
    }

    /// Register the handler for server-initiated requests named `method`,
    /// replacing any previous one. The handler is called on the reader task
    /// before later frames are processed; the future it returns is spawned.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F) -> Unsubscribe
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcErrorPayload>> + Send + 'static,
    {
        let handler_id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        let handler: RequestHandler = Arc::new(move |params| handler(params).boxed());
        self.inner
            .request_handlers
            .lock()
            .insert(method.to_string(), (handler_id, handler));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let method = method.to_string();
        Unsubscribe::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut handlers = inner.request_handlers.lock();
            if handlers
                .get(&method)
                .is_some_and(|(id, _)| *id == handler_id)
            {
                handlers.remove(&method);
            }
        })
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingRequest>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn decode_result<R: DeserializeOwned>(method: &str, value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(|e| ClientError::Decode(format!("{method}: {e}")))
}

impl Inner {
    async fn run_writer(
        self: Arc<Self>,
        generation: u64,
        mut sink: crate::transport::FrameSink,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(
                    component = "rpc",
                    event = "rpc.link.write_failed",
                    generation,
                    error = %e,
                    "Link write failed"
                );
                self.detach(generation, &format!("write failed: {e}"));
                return;
            }
        }
        let _ = sink.close().await;
    }

    async fn run_reader(
        self: Arc<Self>,
        generation: u64,
        mut stream: crate::transport::FrameStream,
        cancel: CancellationToken,
    ) {
        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(generation, &text),
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("connection closed by server".to_string()),
                },
            }
        };
        if let Some(reason) = reason {
            self.detach(generation, &reason);
        }
    }

    fn detach(&self, generation: u64, reason: &str) -> bool {
        let slot = {
            let mut link = self.link.lock();
            if link.as_ref().is_some_and(|slot| slot.generation == generation) {
                link.take()
            } else {
                None
            }
        };
        let Some(mut slot) = slot else {
            return false;
        };

        slot.cancel.cancel();
        let failed = self.fail_pending(generation);
        info!(
            component = "rpc",
            event = "rpc.link.detached",
            generation,
            failed_requests = failed,
            reason = %reason,
            "Link detached"
        );
        if let Some(closed) = slot.closed.take() {
            let _ = closed.send(reason.to_string());
        }
        true
    }

    fn fail_pending(&self, generation: u64) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.generation == generation)
            .map(|entry| *entry.key())
            .collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.reply.send(Err(ClientError::ConnectionLost));
                failed += 1;
            }
        }
        failed
    }

    /// Write a frame only if link `generation` is still current.
    fn send_on(&self, generation: u64, frame: String) -> bool {
        let link = self.link.lock();
        match link.as_ref() {
            Some(slot) if slot.generation == generation => slot.writer.send(frame).is_ok(),
            _ => false,
        }
    }

    fn handle_frame(self: &Arc<Self>, generation: u64, text: &str) {
        let seq = self.inbound_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    component = "rpc",
                    event = "rpc.frame.parse_failed",
                    generation,
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse inbound frame"
                );
                return;
            }
        };

        match message {
            WireMessage::Response { id, result, error } => {
                let Some((_, request)) = self.pending.remove(&id) else {
                    debug!(
                        component = "rpc",
                        event = "rpc.response.unmatched",
                        request_id = id,
                        "Discarding response with no pending request"
                    );
                    return;
                };
                debug!(
                    component = "rpc",
                    event = "rpc.response.received",
                    request_id = id,
                    method = %request.method,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    ok = error.is_none(),
                    "Response received"
                );
                let outcome = match error {
                    Some(error) => Err(ClientError::from(error)),
                    None => Ok((result.unwrap_or(Value::Null), seq)),
                };
                let _ = request.reply.send(outcome);
            }
            WireMessage::Notification { topic, payload } => {
                let handlers: Vec<NotificationHandler> = self
                    .topics
                    .lock()
                    .get(&topic)
                    .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    debug!(
                        component = "rpc",
                        event = "rpc.notification.unhandled",
                        topic = %topic,
                        "No handler for notification"
                    );
                    return;
                }
                let notification = Notification {
                    topic,
                    payload,
                    seq,
                };
                for handler in handlers {
                    handler(&notification);
                }
            }
            WireMessage::Request { id, method, params } => {
                let handler = self
                    .request_handlers
                    .lock()
                    .get(&method)
                    .map(|(_, h)| Arc::clone(h));
                // The handler itself runs here, in frame order; only the
                // future it returns is awaited off the reader task.
                let call = handler.map(|handler| handler(params));
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = match call {
                        Some(call) => call.await,
                        None => {
                            warn!(
                                component = "rpc",
                                event = "rpc.server_request.unknown_method",
                                request_id = id,
                                method = %method,
                                "No handler for server request"
                            );
                            Err(RpcErrorPayload::method_not_found(&method))
                        }
                    };
                    match WireMessage::response(id, outcome).encode() {
                        Ok(frame) => {
                            if !inner.send_on(generation, frame) {
                                debug!(
                                    component = "rpc",
                                    event = "rpc.server_request.link_gone",
                                    request_id = id,
                                    method = %method,
                                    "Link closed before the response could be sent"
                                );
                            }
                        }
                        Err(e) => warn!(
                            component = "rpc",
                            event = "rpc.server_request.encode_failed",
                            request_id = id,
                            error = %e,
                            "Failed to encode response"
                        ),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, Connector, MemoryPeer};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn ready_dispatcher(timeout: Option<Duration>) -> (RpcDispatcher, MemoryPeer, LinkHandle) {
        let (connector, mut listener) = memory_pair();
        let link = connector.connect("memory://rpc").await.expect("connect");
        let peer = listener.accept().await.expect("peer");
        let rpc = RpcDispatcher::new(timeout);
        let handle = rpc.attach(link);
        assert!(rpc.mark_ready(handle.generation()));
        (rpc, peer, handle)
    }

    async fn next_frame(peer: &mut MemoryPeer) -> WireMessage {
        let text = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .expect("frame in time")
            .expect("link open");
        WireMessage::decode(&text).expect("valid frame")
    }

    async fn next_request(peer: &mut MemoryPeer) -> (RequestId, String, Value) {
        match next_frame(peer).await {
            WireMessage::Request { id, method, params } => (id, method, params),
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn send(peer: &MemoryPeer, message: WireMessage) {
        assert!(peer.send(message.encode().expect("encode")));
    }

    #[tokio::test]
    async fn responses_match_by_id_not_arrival_order() {
        let (rpc, mut peer, _handle) = ready_dispatcher(Some(Duration::from_secs(5))).await;

        let first = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.request::<_, Value>("echo", json!({"n": 1})).await }
        });
        let (first_id, _, first_params) = next_request(&mut peer).await;
        let second = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.request::<_, Value>("echo", json!({"n": 2})).await }
        });
        let (second_id, _, second_params) = next_request(&mut peer).await;
        assert_ne!(first_id, second_id);

        send(&peer, WireMessage::success(second_id, second_params["n"].clone()));
        send(&peer, WireMessage::success(first_id, first_params["n"].clone()));

        assert_eq!(first.await.expect("join").expect("first"), json!(1));
        assert_eq!(second.await.expect("join").expect("second"), json!(2));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_becomes_rpc_error() {
        let (rpc, mut peer, _handle) = ready_dispatcher(None).await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.request::<_, Value>("create_session", json!({})).await }
        });
        let (id, method, _) = next_request(&mut peer).await;
        assert_eq!(method, "create_session");
        send(
            &peer,
            WireMessage::failure(id, RpcErrorPayload::invalid_params("cwd is required")),
        );
        match call.await.expect("join") {
            Err(ClientError::Rpc { code, message, .. }) => {
                assert_eq!(code, RpcErrorPayload::INVALID_PARAMS);
                assert_eq!(message, "cwd is required");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_before_ready_fail_fast() {
        let (connector, mut listener) = memory_pair();
        let link = connector.connect("memory://rpc").await.expect("connect");
        let _peer = listener.accept().await.expect("peer");
        let rpc = RpcDispatcher::new(None);

        let err = rpc.request::<_, Value>("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        let _handle = rpc.attach(link);
        let err = rpc.request::<_, Value>("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(matches!(
            rpc.notify("hello", json!({})),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn link_drop_rejects_every_pending_request() {
        let (rpc, mut peer, mut handle) = ready_dispatcher(None).await;

        let calls: Vec<_> = (0..5)
            .map(|n| {
                let rpc = rpc.clone();
                tokio::spawn(async move { rpc.request::<_, Value>("slow", json!({"n": n})).await })
            })
            .collect();
        for _ in 0..5 {
            next_request(&mut peer).await;
        }
        assert_eq!(rpc.pending_count(), 5);

        drop(peer);
        for call in calls {
            let err = call.await.expect("join").unwrap_err();
            assert!(matches!(err, ClientError::ConnectionLost), "got {err:?}");
        }
        assert_eq!(rpc.pending_count(), 0);
        assert_eq!(handle.closed().await, "connection closed by server");
        assert!(!rpc.is_ready());
    }

    #[tokio::test]
    async fn timeout_and_drop_clear_pending_entries() {
        let (rpc, mut peer, _handle) = ready_dispatcher(Some(Duration::from_millis(50))).await;

        let err = rpc.request::<_, Value>("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { ref method, .. } if method == "slow"));
        assert_eq!(rpc.pending_count(), 0);

        let (late_id, _, _) = next_request(&mut peer).await;
        // A late response for a timed-out request is discarded quietly.
        send(&peer, WireMessage::success(late_id, json!({})));

        let abandoned = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.request_with_timeout::<_, Value>("forever", json!({}), None)
                    .await
            }
        });
        next_request(&mut peer).await;
        assert_eq!(rpc.pending_count(), 1);
        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn notifications_fan_out_until_unsubscribed() {
        let (rpc, peer, _handle) = ready_dispatcher(None).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_sub = rpc.on("session/activated", {
            let first = Arc::clone(&first);
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _second_sub = rpc.on("session/activated", {
            let second = Arc::clone(&second);
            move |notification| {
                assert_eq!(notification.payload["session_id"], "abc123");
                second.fetch_add(1, Ordering::SeqCst);
            }
        });

        let frame =
            WireMessage::notification("session/activated", json!({"session_id": "abc123"}))
                .expect("build");
        send(&peer, frame.clone());
        // Round-trip a request so the notification has been processed.
        let sync = |rpc: RpcDispatcher| async move {
            rpc.request_with_timeout::<_, Value>("ping", json!({}), Some(Duration::from_secs(2)))
                .await
        };
        let mut peer = peer;
        let pending = tokio::spawn(sync(rpc.clone()));
        let (id, _, _) = next_request(&mut peer).await;
        send(&peer, WireMessage::success(id, json!({})));
        pending.await.expect("join").expect("ping");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        first_sub.unsubscribe();
        send(&peer, frame);
        let pending = tokio::spawn(sync(rpc.clone()));
        let (id, _, _) = next_request(&mut peer).await;
        send(&peer, WireMessage::success(id, json!({})));
        pending.await.expect("join").expect("ping");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequenced_reply_orders_against_notifications() {
        let (rpc, mut peer, _handle) = ready_dispatcher(None).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = rpc.on("session/update", {
            let seen = Arc::clone(&seen);
            move |notification| seen.lock().push(notification.seq)
        });

        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move {
                rpc.call_sequenced::<_, Value>("subscribe_session", json!({"session_id": "s"}))
                    .await
            }
        });
        let (id, _, _) = next_request(&mut peer).await;
        let update = WireMessage::notification("session/update", json!({})).expect("build");
        send(&peer, update.clone());
        send(&peer, WireMessage::success(id, json!({"session_id": "s"})));
        send(&peer, update);

        let reply = call.await.expect("join").expect("reply");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] < reply.seq && reply.seq < seen[1]);
    }

    #[tokio::test]
    async fn server_requests_are_answered_on_the_same_link() {
        let (rpc, mut peer, _handle) = ready_dispatcher(None).await;
        let _handler = rpc.on_request("session/request_permission", |params: Value| async move {
            Ok(json!({"echo": params["session_id"].clone()}))
        });

        send(
            &peer,
            WireMessage::request(41, "session/request_permission", json!({"session_id": "s1"}))
                .expect("build"),
        );
        match next_frame(&mut peer).await {
            WireMessage::Response { id, result, error } => {
                assert_eq!(id, 41);
                assert!(error.is_none());
                assert_eq!(result, Some(json!({"echo": "s1"})));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        send(
            &peer,
            WireMessage::request(42, "fs/format_disk", json!({})).expect("build"),
        );
        match next_frame(&mut peer).await {
            WireMessage::Response {
                id,
                error: Some(error),
                ..
            } => {
                assert_eq!(id, 42);
                assert_eq!(error.code, RpcErrorPayload::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
