//! Session subscription registry.
//!
//! At most one entry per session: `Subscribing` while the `subscribe_session`
//! RPC is in flight, `Subscribed` once its baseline is installed. Concurrent
//! callers share one in-flight future, so a session is never subscribed twice.
//! An unsubscribe holds the slot as `Unsubscribing` until the server has
//! answered, so a new subscribe is never overtaken by a stale unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aerolink_protocol::{method, SessionId, SessionIdParams, SessionState};
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::rpc::RpcDispatcher;
use crate::sessions::SessionStore;

/// Proof of an established subscription. Every caller that joined the same
/// subscribe attempt receives an equal handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubscription {
    pub session_id: SessionId,
    /// Identifies the subscribe attempt that established it.
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

type SharedSubscribe = Shared<BoxFuture<'static, Result<SessionSubscription>>>;
type SharedDone = Shared<BoxFuture<'static, ()>>;

enum Entry {
    Subscribing { epoch: u64, future: SharedSubscribe },
    Subscribed(SessionSubscription),
    /// No longer tracked; `unsubscribe_session` has not settled yet.
    Unsubscribing { epoch: u64, done: SharedDone },
}

enum Slot {
    Join(SharedSubscribe),
    Wait(SharedDone),
}

struct Inner {
    rpc: RpcDispatcher,
    store: Arc<SessionStore>,
    entries: Mutex<HashMap<SessionId, Entry>>,
    next_epoch: AtomicU64,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(rpc: RpcDispatcher, store: Arc<SessionStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rpc,
                store,
                entries: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to `session_id`, joining an in-flight attempt if there is one.
    /// Waits for an unsubscribe of the same session to settle first.
    pub async fn subscribe(&self, session_id: &str) -> Result<SessionSubscription> {
        loop {
            let slot = {
                let mut entries = self.inner.entries.lock();
                match entries.get(session_id) {
                    Some(Entry::Subscribed(subscription)) => return Ok(subscription.clone()),
                    Some(Entry::Subscribing { future, .. }) => Slot::Join(future.clone()),
                    Some(Entry::Unsubscribing { done, .. }) => Slot::Wait(done.clone()),
                    None => {
                        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                        let future = self.start(session_id.to_string(), epoch);
                        entries.insert(
                            session_id.to_string(),
                            Entry::Subscribing {
                                epoch,
                                future: future.clone(),
                            },
                        );
                        Slot::Join(future)
                    }
                }
            };
            match slot {
                Slot::Join(future) => return future.await,
                Slot::Wait(done) => done.await,
            }
        }
    }

    /// Spawn the subscribe driver so it settles even if every caller stops
    /// waiting.
    fn start(&self, session_id: SessionId, epoch: u64) -> SharedSubscribe {
        let inner = Arc::clone(&self.inner);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = inner.drive_subscribe(session_id, epoch).await;
            let _ = done_tx.send(outcome);
        });
        async move { done_rx.await.unwrap_or(Err(ClientError::ConnectionLost)) }
            .boxed()
            .shared()
    }

    /// Stop tracking `session_id` and tell the server. Unknown sessions are a
    /// no-op.
    pub async fn unsubscribe(&self, session_id: &str) -> Result<()> {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = {
            let mut entries = self.inner.entries.lock();
            if matches!(
                entries.get(session_id),
                None | Some(Entry::Unsubscribing { .. })
            ) {
                return Ok(());
            }
            let done = async move {
                let _ = done_rx.await;
            }
            .boxed()
            .shared();
            entries.insert(session_id.to_string(), Entry::Unsubscribing { epoch, done })
        };
        let _slot = UnsubscribingSlot {
            inner: &self.inner,
            session_id,
            epoch,
            _done: done_tx,
        };

        if let Some(Entry::Subscribing { future, .. }) = previous {
            if future.await.is_err() {
                // Never established; nothing to undo server-side.
                return Ok(());
            }
        }

        match self
            .inner
            .rpc
            .request::<_, Value>(method::UNSUBSCRIBE_SESSION, SessionIdParams::new(session_id))
            .await
        {
            Ok(_) => {
                info!(
                    component = "subscriptions",
                    event = "subscriptions.session.unsubscribed",
                    session_id = %session_id,
                    "Unsubscribed from session"
                );
                Ok(())
            }
            Err(ClientError::NotConnected | ClientError::ConnectionLost) => {
                debug!(
                    component = "subscriptions",
                    event = "subscriptions.session.unsubscribed_offline",
                    session_id = %session_id,
                    "Unsubscribed while offline"
                );
                Ok(())
            }
            Err(e) => Err(ClientError::Subscription {
                session_id: session_id.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Re-issue `subscribe_session` for every established subscription.
    /// Failures are logged; the entry stays tracked for the next reconnect.
    /// Returns how many sessions resynced.
    pub async fn resubscribe_all(&self) -> usize {
        let targets: Vec<SessionId> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Subscribed(_)))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        if targets.is_empty() {
            return 0;
        }

        info!(
            component = "subscriptions",
            event = "subscriptions.resubscribe.started",
            sessions = targets.len(),
            "Re-subscribing after reconnect"
        );

        let results = join_all(targets.iter().map(|session_id| {
            let inner = Arc::clone(&self.inner);
            async move { inner.resync(session_id).await }
        }))
        .await;

        let mut resynced = 0;
        for (session_id, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => resynced += 1,
                Err(e) => warn!(
                    component = "subscriptions",
                    event = "subscriptions.resubscribe.failed",
                    session_id = %session_id,
                    error = %e,
                    "Re-subscribe failed; will retry on next reconnect"
                ),
            }
        }
        resynced
    }

    pub fn status(&self, session_id: &str) -> SubscriptionStatus {
        match self.inner.entries.lock().get(session_id) {
            None => SubscriptionStatus::Unsubscribed,
            Some(Entry::Subscribing { .. }) => SubscriptionStatus::Subscribing,
            Some(Entry::Subscribed(_)) => SubscriptionStatus::Subscribed,
            Some(Entry::Unsubscribing { .. }) => SubscriptionStatus::Unsubscribed,
        }
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.status(session_id) == SubscriptionStatus::Subscribed
    }

    /// Sessions with an established subscription, sorted.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Subscribed(_)))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Fetch a fresh baseline for a session, ordered against racing updates.
    pub(crate) async fn refresh(&self, session_id: &str) -> Result<SessionState> {
        self.inner.fetch_baseline(method::GET_SESSION_STATE, session_id).await
    }
}

impl Inner {
    async fn drive_subscribe(&self, session_id: SessionId, epoch: u64) -> Result<SessionSubscription> {
        match self.fetch_baseline(method::SUBSCRIBE_SESSION, &session_id).await {
            Ok(_) => {
                let subscription = SessionSubscription {
                    session_id: session_id.clone(),
                    epoch,
                };
                let mut entries = self.entries.lock();
                if matches!(entries.get(&session_id), Some(Entry::Subscribing { epoch: current, .. }) if *current == epoch)
                {
                    entries.insert(session_id.clone(), Entry::Subscribed(subscription.clone()));
                }
                drop(entries);
                info!(
                    component = "subscriptions",
                    event = "subscriptions.session.subscribed",
                    session_id = %session_id,
                    epoch,
                    "Subscribed to session"
                );
                Ok(subscription)
            }
            Err(e) => {
                {
                    let mut entries = self.entries.lock();
                    if matches!(entries.get(&session_id), Some(Entry::Subscribing { epoch: current, .. }) if *current == epoch)
                    {
                        entries.remove(&session_id);
                    }
                }
                warn!(
                    component = "subscriptions",
                    event = "subscriptions.session.subscribe_failed",
                    session_id = %session_id,
                    error = %e,
                    "Subscribe failed"
                );
                Err(ClientError::Subscription {
                    session_id,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn resync(&self, session_id: &str) -> Result<()> {
        let outcome = self
            .fetch_baseline(method::SUBSCRIBE_SESSION, session_id)
            .await
            .map(|_| ());
        // Unsubscribed while the baseline was in flight.
        self.forget_if_untracked(session_id);
        outcome
    }

    fn forget_if_untracked(&self, session_id: &str) {
        let entries = self.entries.lock();
        if !entries.contains_key(session_id) {
            self.store.forget(session_id);
        }
    }

    /// Issue `method` for `session_id` and install the returned state as the
    /// session's baseline.
    async fn fetch_baseline(&self, method: &str, session_id: &str) -> Result<SessionState> {
        self.store.begin_sync(session_id);
        match self
            .rpc
            .call_sequenced::<_, SessionState>(method, SessionIdParams::new(session_id))
            .await
        {
            Ok(reply) => {
                self.store
                    .install_baseline(session_id, reply.value.clone(), reply.seq);
                Ok(reply.value)
            }
            Err(e) => {
                self.store.abort_sync(session_id);
                Err(e)
            }
        }
    }
}

/// Releases an `Unsubscribing` slot however the unsubscribe ends, then wakes
/// subscribers waiting on it.
struct UnsubscribingSlot<'a> {
    inner: &'a Inner,
    session_id: &'a str,
    epoch: u64,
    _done: oneshot::Sender<()>,
}

impl Drop for UnsubscribingSlot<'_> {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        if matches!(
            entries.get(self.session_id),
            Some(Entry::Unsubscribing { epoch, .. }) if *epoch == self.epoch
        ) {
            entries.remove(self.session_id);
            self.inner.store.forget(self.session_id);
        }
    }
}
