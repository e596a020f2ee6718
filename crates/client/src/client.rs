//! The client context object.
//!
//! `Client` builds one instance of every component and wires them together:
//! `session/update` feeds the session store, `session/activated` moves the
//! active-session pointer, permission requests go to the coordinator, and a
//! reconnect re-subscribes every tracked session. Cheap to clone.

use std::sync::Arc;

use aerolink_protocol::{
    method, topic, CreateSessionParams, ListSessionsParams, ListSessionsResponse,
    NewSessionResponse, PermissionOutcome, PermissionRequestParams, PermissionResponse,
    PromptParams, PromptResponse, RpcErrorPayload, SessionActivatedNotification, SessionCwdParams,
    SessionId, SessionIdParams, SessionInfo, SessionState, SessionUpdateNotification,
    SetSessionModeParams, SetSessionModelParams,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::Result;
use crate::permissions::{PermissionCoordinator, PermissionRequest, PermissionState};
use crate::rpc::{RpcDispatcher, Unsubscribe};
use crate::services::{FileService, TerminalService};
use crate::session_state::{SessionEvent, SessionSnapshot};
use crate::sessions::SessionStore;
use crate::subscriptions::{SessionSubscription, SubscriptionRegistry, SubscriptionStatus};
use crate::transport::{Connector, WsConnector};

struct ClientInner {
    config: ClientConfig,
    rpc: RpcDispatcher,
    connection: ConnectionManager,
    store: Arc<SessionStore>,
    subscriptions: SubscriptionRegistry,
    permissions: PermissionCoordinator,
    files: FileService,
    terminals: TerminalService,
    active_session: watch::Sender<Option<SessionId>>,
    wiring: Mutex<Vec<Unsubscribe>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client over a WebSocket to `config.url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, WsConnector)
    }

    /// Client over any transport. Must be called inside a Tokio runtime.
    pub fn with_connector(config: ClientConfig, connector: impl Connector) -> Result<Self> {
        config.validate()?;

        let rpc = RpcDispatcher::new(config.request_timeout());
        let connection = ConnectionManager::new(config.clone(), Arc::new(connector), rpc.clone());
        let store = Arc::new(SessionStore::new());
        let subscriptions = SubscriptionRegistry::new(rpc.clone(), Arc::clone(&store));
        let permissions = PermissionCoordinator::new();
        let (active_session, _) = watch::channel(None);

        let client = Self {
            inner: Arc::new(ClientInner {
                files: FileService::new(rpc.clone()),
                terminals: TerminalService::new(rpc.clone()),
                config,
                rpc,
                connection,
                store,
                subscriptions,
                permissions,
                active_session,
                wiring: Mutex::new(Vec::new()),
            }),
        };
        client.wire();
        Ok(client)
    }

    fn wire(&self) {
        let inner = &self.inner;
        let mut wiring = Vec::new();

        wiring.push(inner.rpc.on(topic::SESSION_UPDATE, {
            let store = Arc::clone(&inner.store);
            move |notification| {
                match serde_json::from_value::<SessionUpdateNotification>(
                    notification.payload.clone(),
                ) {
                    Ok(update) => {
                        store.handle_update(&update.session_id, update.update, notification.seq)
                    }
                    Err(e) => warn!(
                        component = "client",
                        event = "client.session_update.decode_failed",
                        error = %e,
                        "Malformed session update"
                    ),
                }
            }
        }));

        wiring.push(inner.rpc.on(topic::SESSION_ACTIVATED, {
            let active_session = inner.active_session.clone();
            move |notification| {
                match serde_json::from_value::<SessionActivatedNotification>(
                    notification.payload.clone(),
                ) {
                    Ok(activated) => {
                        info!(
                            component = "client",
                            event = "client.session.activated",
                            session_id = %activated.session_id,
                            "Session activated"
                        );
                        active_session.send_replace(Some(activated.session_id));
                    }
                    Err(e) => warn!(
                        component = "client",
                        event = "client.session_activated.decode_failed",
                        error = %e,
                        "Malformed session activation"
                    ),
                }
            }
        }));

        wiring.push(inner.rpc.on_request(method::REQUEST_PERMISSION, {
            let permissions = inner.permissions.clone();
            move |params: Value| {
                // Registered before the next frame, so a prompt response
                // that follows finds the request to cancel.
                let decision = serde_json::from_value::<PermissionRequestParams>(params)
                    .map(|params| permissions.request(params));
                async move {
                    let outcome = decision
                        .map_err(|e| RpcErrorPayload::invalid_params(e.to_string()))?
                        .await;
                    serde_json::to_value(PermissionResponse { outcome })
                        .map_err(|e| RpcErrorPayload::internal(e.to_string()))
                }
            }
        }));

        wiring.push(inner.connection.on_reconnect({
            let subscriptions = inner.subscriptions.clone();
            move || {
                let subscriptions = subscriptions.clone();
                async move {
                    subscriptions.resubscribe_all().await;
                }
            }
        }));

        // Outstanding decisions die with the connection that carried them.
        let mut status = inner.connection.watch_status();
        let permissions = inner.permissions.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let state = status.borrow_and_update().state;
                if matches!(
                    state,
                    ConnectionState::Error | ConnectionState::Disconnected
                ) {
                    permissions.cancel_all("connection closed");
                }
            }
        });

        inner.wiring.lock().extend(wiring);
    }

    // -- Connection ----------------------------------------------------------

    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
        self.inner.permissions.cancel_all("client disconnected");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.watch_status()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn rpc(&self) -> &RpcDispatcher {
        &self.inner.rpc
    }

    pub fn files(&self) -> &FileService {
        &self.inner.files
    }

    pub fn terminals(&self) -> &TerminalService {
        &self.inner.terminals
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    pub fn permissions(&self) -> &PermissionCoordinator {
        &self.inner.permissions
    }

    // -- Session lifecycle ---------------------------------------------------

    pub async fn create_session(&self, cwd: &str) -> Result<NewSessionResponse> {
        let response: NewSessionResponse = self
            .inner
            .rpc
            .request(
                method::CREATE_SESSION,
                CreateSessionParams {
                    cwd: cwd.to_string(),
                },
            )
            .await?;
        self.adopt_session(&response, cwd, "created");
        Ok(response)
    }

    pub async fn resume_session(&self, session_id: &str, cwd: &str) -> Result<NewSessionResponse> {
        let response: NewSessionResponse = self
            .inner
            .rpc
            .request(method::RESUME_SESSION, session_cwd(session_id, cwd))
            .await?;
        self.adopt_session(&response, cwd, "resumed");
        Ok(response)
    }

    /// Branch an existing session; the response names the new session.
    pub async fn fork_session(&self, session_id: &str, cwd: &str) -> Result<NewSessionResponse> {
        let response: NewSessionResponse = self
            .inner
            .rpc
            .request(method::FORK_SESSION, session_cwd(session_id, cwd))
            .await?;
        self.adopt_session(&response, cwd, "forked");
        Ok(response)
    }

    fn adopt_session(&self, response: &NewSessionResponse, cwd: &str, how: &str) {
        self.inner.store.seed(response, cwd);
        self.inner
            .active_session
            .send_replace(Some(response.session_id.clone()));
        info!(
            component = "client",
            event = "client.session.adopted",
            session_id = %response.session_id,
            how,
            "Session ready"
        );
    }

    pub async fn list_sessions(&self, params: ListSessionsParams) -> Result<ListSessionsResponse> {
        self.inner.rpc.request(method::LIST_SESSIONS, params).await
    }

    pub async fn get_session_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.inner
            .rpc
            .request(method::GET_SESSION_INFO, SessionIdParams::new(session_id))
            .await
    }

    // -- Subscriptions and state ---------------------------------------------

    pub async fn subscribe_session(&self, session_id: &str) -> Result<SessionSubscription> {
        self.inner.subscriptions.subscribe(session_id).await
    }

    pub async fn unsubscribe_session(&self, session_id: &str) -> Result<()> {
        self.inner.subscriptions.unsubscribe(session_id).await
    }

    pub fn subscription_status(&self, session_id: &str) -> SubscriptionStatus {
        self.inner.subscriptions.status(session_id)
    }

    /// Full server state. For a subscribed session the cached baseline is
    /// refreshed as well.
    pub async fn get_session_state(&self, session_id: &str) -> Result<SessionState> {
        if self.inner.subscriptions.is_subscribed(session_id) {
            return self.inner.subscriptions.refresh(session_id).await;
        }
        self.inner
            .rpc
            .request(method::GET_SESSION_STATE, SessionIdParams::new(session_id))
            .await
    }

    /// Latest local view of a session.
    pub fn session(&self, session_id: &str) -> Option<Arc<SessionSnapshot>> {
        self.inner.store.snapshot(session_id)
    }

    pub fn watch_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.inner.store.events(session_id)
    }

    pub async fn set_session_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        let _: Value = self
            .inner
            .rpc
            .request(
                method::SET_SESSION_MODEL,
                SetSessionModelParams {
                    session_id: session_id.to_string(),
                    model_id: model_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        let _: Value = self
            .inner
            .rpc
            .request(
                method::SET_SESSION_MODE,
                SetSessionModeParams {
                    session_id: session_id.to_string(),
                    mode_id: mode_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // -- Prompting -----------------------------------------------------------

    /// Show a user message immediately; returns its ID for
    /// [`prompt_with_message_id`](Self::prompt_with_message_id).
    pub fn add_optimistic_message(&self, session_id: &str, content: &str) -> String {
        self.inner.store.add_optimistic_message(session_id, content)
    }

    pub async fn prompt(&self, session_id: &str, content: &str) -> Result<PromptResponse> {
        let message_id = self.add_optimistic_message(session_id, content);
        self.prompt_with_message_id(session_id, &message_id, content)
            .await
    }

    /// Send a prompt whose optimistic message already exists. Waits for the
    /// whole turn, so no request timeout applies. On failure the optimistic
    /// message is marked failed; a pending permission decision is cancelled
    /// however the turn ends.
    pub async fn prompt_with_message_id(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<PromptResponse> {
        let _permission = self.inner.permissions.guard(session_id);
        let outcome: Result<PromptResponse> = self
            .inner
            .rpc
            .request_with_timeout(
                method::PROMPT,
                PromptParams {
                    session_id: session_id.to_string(),
                    message_id: message_id.to_string(),
                    content: content.to_string(),
                },
                None,
            )
            .await;

        if let Err(e) = &outcome {
            warn!(
                component = "client",
                event = "client.prompt.failed",
                session_id = %session_id,
                message_id = %message_id,
                error = %e,
                "Prompt failed"
            );
            self.inner.store.mark_failed(session_id, message_id);
        }
        outcome
    }

    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let _: Value = self
            .inner
            .rpc
            .request(method::CANCEL_SESSION, SessionIdParams::new(session_id))
            .await?;
        Ok(())
    }

    // -- Permissions ---------------------------------------------------------

    pub fn respond_permission(&self, session_id: &str, outcome: PermissionOutcome) -> Result<()> {
        self.inner.permissions.resolve(session_id, outcome)
    }

    pub fn permission_state(&self, session_id: &str) -> PermissionState {
        self.inner.permissions.state(session_id)
    }

    pub fn watch_permissions(&self) -> watch::Receiver<Vec<PermissionRequest>> {
        self.inner.permissions.watch()
    }

    // -- Active session ------------------------------------------------------

    pub fn active_session(&self) -> Option<SessionId> {
        self.inner.active_session.borrow().clone()
    }

    pub fn watch_active_session(&self) -> watch::Receiver<Option<SessionId>> {
        self.inner.active_session.subscribe()
    }
}

fn session_cwd(session_id: &str, cwd: &str) -> SessionCwdParams {
    SessionCwdParams {
        session_id: session_id.to_string(),
        cwd: cwd.to_string(),
    }
}
