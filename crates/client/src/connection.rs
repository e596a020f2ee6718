//! Connection manager.
//!
//! Owns the socket lifecycle: connect, `initialize` handshake, heartbeat,
//! reconnect with backoff, and teardown. Status is published on a `watch`
//! channel; everything else observes it and never mutates it.
//!
//! Lifecycle: `Idle` → `Running` (supervisor task alive) → `ShutDown`.
//! `disconnect()` is terminal.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aerolink_protocol::{
    method, ClientCapabilities, ClientInfo, InitializeParams, InitializeResponse,
    PROTOCOL_VERSION,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::rpc::{LinkHandle, RpcDispatcher, Unsubscribe};
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub url: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

enum Lifecycle {
    Idle,
    Running {
        cancel: CancellationToken,
        supervisor: JoinHandle<()>,
    },
    ShutDown,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    rpc: RpcDispatcher,
    backoff: Backoff,
    status: watch::Sender<ConnectionStatus>,
    lifecycle: Mutex<Lifecycle>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_callbacks: Mutex<Vec<(u64, ReconnectCallback)>>,
    next_callback: AtomicU64,
    server: Mutex<Option<InitializeResponse>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, rpc: RpcDispatcher) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            url: config.url.clone(),
            state: ConnectionState::Disconnected,
            last_error: None,
            reconnect_attempt: 0,
        });
        Self {
            inner: Arc::new(Inner {
                backoff: Backoff::new(config.backoff.clone()),
                config,
                connector,
                rpc,
                status,
                lifecycle: Mutex::new(Lifecycle::Idle),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                server: Mutex::new(None),
            }),
        }
    }

    /// Open the link and complete the handshake. Resolves once the server has
    /// answered `initialize`. A no-op while already running.
    pub async fn connect(&self) -> Result<()> {
        let _serial = self.inner.connect_lock.lock().await;
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::ShutDown => return Err(ClientError::ShutDown),
            Lifecycle::Idle => {}
        }

        let handle = self.inner.establish(0).await?;

        let mut lifecycle = self.inner.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::ShutDown) {
            // disconnect() ran while the handshake was in flight.
            drop(lifecycle);
            self.inner
                .rpc
                .detach(handle.generation(), "client disconnected");
            self.inner.set_status(ConnectionState::Disconnected, None, 0);
            return Err(ClientError::ShutDown);
        }
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(Arc::clone(&self.inner).supervise(handle, cancel.clone()));
        *lifecycle = Lifecycle::Running { cancel, supervisor };
        Ok(())
    }

    /// Close the link and stop reconnecting. Pending requests fail with
    /// `ConnectionLost`. Idempotent; the manager cannot be reused.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.lifecycle.lock(), Lifecycle::ShutDown);
        if let Lifecycle::Running { cancel, supervisor } = previous {
            cancel.cancel();
            let _ = supervisor.await;
        }
        let detached = self.inner.rpc.detach_current("client disconnected");
        self.inner.set_status(ConnectionState::Disconnected, None, 0);
        if detached {
            info!(
                component = "connection",
                event = "connection.closed",
                url = %self.inner.config.url,
                "Disconnected"
            );
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().state == ConnectionState::Connected
    }

    /// What the server reported in the last successful handshake.
    pub fn server_info(&self) -> Option<InitializeResponse> {
        self.inner.server.lock().clone()
    }

    /// Run `callback` after every successful re-handshake, in registration
    /// order. Not called for the initial connect.
    pub fn on_reconnect<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        let callback: ReconnectCallback = Arc::new(move || callback().boxed());
        self.inner.reconnect_callbacks.lock().push((id, callback));

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .reconnect_callbacks
                    .lock()
                    .retain(|(callback_id, _)| *callback_id != id);
            }
        })
    }
}

impl Inner {
    fn set_status(&self, state: ConnectionState, last_error: Option<String>, attempt: u32) {
        self.status.send_if_modified(|status| {
            let next = ConnectionStatus {
                url: self.config.url.clone(),
                state,
                last_error,
                reconnect_attempt: attempt,
            };
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }

    /// One connect + handshake attempt. On failure the link is torn down and
    /// the status is `Error`, or `Disconnected` after a disconnect.
    async fn establish(&self, attempt: u32) -> Result<LinkHandle> {
        self.set_status(ConnectionState::Connecting, None, attempt);
        debug!(
            component = "connection",
            event = "connection.connecting",
            url = %self.config.url,
            attempt,
            "Connecting"
        );

        let connect_timeout = self.config.connect_timeout();
        let link = match tokio::time::timeout(
            connect_timeout,
            self.connector.connect(&self.config.url),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.fail(attempt, e.to_string())),
            Err(_) => {
                return Err(self.fail(
                    attempt,
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                ))
            }
        };

        let handle = self.rpc.attach(link);
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_info: ClientInfo {
                name: self.config.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ClientCapabilities {
                permissions: true,
                terminal_output: true,
            },
        };

        let response = self
            .rpc
            .handshake::<_, InitializeResponse>(
                method::INITIALIZE,
                params,
                self.config.handshake_timeout(),
            )
            .await
            .and_then(|response| {
                if response.protocol_version == PROTOCOL_VERSION {
                    Ok(response)
                } else {
                    Err(ClientError::Connection(format!(
                        "server speaks protocol {}, client speaks {}",
                        response.protocol_version, PROTOCOL_VERSION
                    )))
                }
            });

        match response {
            Ok(response) if self.rpc.mark_ready(handle.generation()) => {
                info!(
                    component = "connection",
                    event = "connection.established",
                    url = %self.config.url,
                    generation = handle.generation(),
                    attempt,
                    server = ?response.server_info.as_ref().map(|info| info.name.as_str()),
                    "Connected"
                );
                *self.server.lock() = Some(response);
                self.set_status(ConnectionState::Connected, None, 0);
                Ok(handle)
            }
            Ok(_) => Err(self.fail(attempt, "link closed during handshake".to_string())),
            Err(e) => {
                self.rpc
                    .detach(handle.generation(), &format!("handshake failed: {e}"));
                Err(self.fail(attempt, format!("handshake failed: {e}")))
            }
        }
    }

    /// Publish a failed attempt. An attempt cut short by `disconnect()`
    /// keeps the status at `Disconnected` and reports `ShutDown`.
    fn fail(&self, attempt: u32, message: String) -> ClientError {
        // Held while publishing so disconnect() cannot interleave.
        let lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::ShutDown) {
            debug!(
                component = "connection",
                event = "connection.attempt.abandoned",
                url = %self.config.url,
                attempt,
                error = %message,
                "Connection attempt ended by disconnect"
            );
            self.set_status(ConnectionState::Disconnected, None, 0);
            return ClientError::ShutDown;
        }
        warn!(
            component = "connection",
            event = "connection.failed",
            url = %self.config.url,
            attempt,
            error = %message,
            "Connection attempt failed"
        );
        self.set_status(ConnectionState::Error, Some(message.clone()), attempt);
        drop(lifecycle);
        ClientError::Connection(message)
    }

    async fn supervise(self: Arc<Self>, handle: LinkHandle, cancel: CancellationToken) {
        self.run_supervisor(handle, &cancel).await;
        self.rpc.detach_current("client disconnected");
    }

    /// Watch the live link; on unexpected closure, reconnect until cancelled.
    async fn run_supervisor(&self, mut handle: LinkHandle, cancel: &CancellationToken) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                reason = handle.closed() => reason,
                reason = self.heartbeat() => {
                    self.rpc.detach(handle.generation(), &reason);
                    reason
                }
            };

            warn!(
                component = "connection",
                event = "connection.lost",
                url = %self.config.url,
                reason = %reason,
                "Connection lost"
            );
            self.set_status(ConnectionState::Error, Some(reason), 0);

            let mut attempt: u32 = 0;
            handle = loop {
                let delay = self.backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                info!(
                    component = "connection",
                    event = "connection.reconnect.scheduled",
                    url = %self.config.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    outcome = self.establish(attempt) => outcome,
                };
                if let Ok(handle) = outcome {
                    break handle;
                }
            };

            let callbacks: Vec<ReconnectCallback> = self
                .reconnect_callbacks
                .lock()
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            for callback in callbacks {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = callback() => {}
                }
            }
        }
    }

    /// Ping on every interval; returns the failure reason. Never returns when
    /// the heartbeat is disabled.
    async fn heartbeat(&self) -> String {
        let Some(interval) = self.config.heartbeat_interval() else {
            return std::future::pending().await;
        };
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self
                .rpc
                .request_with_timeout::<_, Value>(
                    method::PING,
                    serde_json::json!({}),
                    Some(self.config.heartbeat_timeout()),
                )
                .await
            {
                Ok(_) => debug!(
                    component = "connection",
                    event = "connection.heartbeat.ok",
                    "Heartbeat acknowledged"
                ),
                Err(e) => return format!("heartbeat failed: {e}"),
            }
        }
    }
}
