//! Permission/interrupt coordinator.
//!
//! The server asks for a decision mid-prompt with `session/request_permission`.
//! Each session holds at most one outstanding request; the UI reads them from
//! [`PermissionCoordinator::watch`] and answers with
//! [`PermissionCoordinator::resolve`]. Every request settles exactly once,
//! either with the user's choice or as `Cancelled`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aerolink_protocol::{
    PermissionOption, PermissionOutcome, PermissionRequestParams, SessionId, ToolCall,
};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub ticket: u64,
    pub session_id: SessionId,
    pub tool_call: ToolCall,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionState {
    Idle,
    AwaitingDecision(PermissionRequest),
}

struct Outstanding {
    request: PermissionRequest,
    reply: oneshot::Sender<PermissionOutcome>,
}

struct Inner {
    outstanding: Mutex<HashMap<SessionId, Outstanding>>,
    next_ticket: AtomicU64,
    published: watch::Sender<Vec<PermissionRequest>>,
}

impl Inner {
    fn publish(&self, outstanding: &HashMap<SessionId, Outstanding>) {
        let mut requests: Vec<PermissionRequest> = outstanding
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by_key(|request| request.ticket);
        self.published.send_replace(requests);
    }

    fn cancel(&self, session_id: &str, reason: &str) -> bool {
        let mut outstanding = self.outstanding.lock();
        let Some(entry) = outstanding.remove(session_id) else {
            return false;
        };
        self.publish(&outstanding);
        drop(outstanding);

        info!(
            component = "permissions",
            event = "permissions.request.cancelled",
            session_id = %session_id,
            ticket = entry.request.ticket,
            reason = %reason,
            "Permission request cancelled"
        );
        let _ = entry.reply.send(PermissionOutcome::Cancelled);
        true
    }
}

#[derive(Clone)]
pub struct PermissionCoordinator {
    inner: Arc<Inner>,
}

impl Default for PermissionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCoordinator {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                outstanding: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                published,
            }),
        }
    }

    /// Register a server request now and return a future for its decision.
    /// A newer request for the same session cancels this one.
    pub fn request(
        &self,
        params: PermissionRequestParams,
    ) -> impl Future<Output = PermissionOutcome> + Send + 'static {
        let receiver = self.register(params);
        async move { receiver.await.unwrap_or(PermissionOutcome::Cancelled) }
    }

    fn register(&self, params: PermissionRequestParams) -> oneshot::Receiver<PermissionOutcome> {
        let PermissionRequestParams {
            session_id,
            tool_call,
            options,
        } = params;
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        let superseded = {
            let mut outstanding = self.inner.outstanding.lock();
            let superseded = outstanding.insert(
                session_id.clone(),
                Outstanding {
                    request: PermissionRequest {
                        ticket,
                        session_id: session_id.clone(),
                        tool_call,
                        options,
                    },
                    reply,
                },
            );
            self.inner.publish(&outstanding);
            superseded
        };

        if let Some(previous) = superseded {
            debug!(
                component = "permissions",
                event = "permissions.request.superseded",
                session_id = %session_id,
                ticket = previous.request.ticket,
                "Superseded by a newer permission request"
            );
            let _ = previous.reply.send(PermissionOutcome::Cancelled);
        }

        info!(
            component = "permissions",
            event = "permissions.request.received",
            session_id = %session_id,
            ticket,
            "Permission requested"
        );
        receiver
    }

    /// Settle the session's outstanding request. An option the request did
    /// not offer is rejected and the request stays pending.
    pub fn resolve(&self, session_id: &str, outcome: PermissionOutcome) -> Result<()> {
        let entry = {
            let mut outstanding = self.inner.outstanding.lock();
            let Some(entry) = outstanding.get(session_id) else {
                return Err(ClientError::NoPendingPermission(session_id.to_string()));
            };
            if let PermissionOutcome::Selected { option_id } = &outcome {
                if !entry
                    .request
                    .options
                    .iter()
                    .any(|option| &option.option_id == option_id)
                {
                    return Err(ClientError::UnknownPermissionOption {
                        session_id: session_id.to_string(),
                        option_id: option_id.clone(),
                    });
                }
            }
            let entry = outstanding.remove(session_id);
            self.inner.publish(&outstanding);
            entry
        };

        if let Some(entry) = entry {
            info!(
                component = "permissions",
                event = "permissions.request.resolved",
                session_id = %session_id,
                ticket = entry.request.ticket,
                outcome = ?outcome,
                "Permission resolved"
            );
            let _ = entry.reply.send(outcome);
        }
        Ok(())
    }

    /// Settle the session's outstanding request as `Cancelled`.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.inner.cancel(session_id, "cancelled")
    }

    /// Cancel every outstanding request, returning how many there were.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let sessions: Vec<SessionId> = self.inner.outstanding.lock().keys().cloned().collect();
        sessions
            .iter()
            .filter(|session_id| self.inner.cancel(session_id, reason))
            .count()
    }

    pub fn state(&self, session_id: &str) -> PermissionState {
        match self.inner.outstanding.lock().get(session_id) {
            Some(entry) => PermissionState::AwaitingDecision(entry.request.clone()),
            None => PermissionState::Idle,
        }
    }

    /// Outstanding requests across sessions, oldest first.
    pub fn pending(&self) -> Vec<PermissionRequest> {
        self.inner.published.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<PermissionRequest>> {
        self.inner.published.subscribe()
    }

    /// Clears the session's permission state when dropped.
    pub fn guard(&self, session_id: &str) -> PermissionGuard {
        PermissionGuard {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
        }
    }
}

/// Held for the duration of a prompt. However the prompt ends, a decision
/// still pending for the session is settled as `Cancelled`.
pub struct PermissionGuard {
    inner: Arc<Inner>,
    session_id: SessionId,
}

impl Drop for PermissionGuard {
    fn drop(&mut self) {
        self.inner.cancel(&self.session_id, "prompt finished");
    }
}
