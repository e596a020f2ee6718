//! Client error taxonomy

use std::time::Duration;

use aerolink_protocol::{RpcErrorPayload, SessionId};
use serde_json::Value;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Every failure surfaced by the client.
///
/// `Clone` so a single subscribe outcome can be fanned out to every caller
/// sharing the same in-flight future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost before a response arrived")]
    ConnectionLost,

    #[error("server error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("`{method}` timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("subscription to session {session_id} failed: {message}")]
    Subscription {
        session_id: SessionId,
        message: String,
    },

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("no permission request is pending for session {0}")]
    NoPendingPermission(SessionId),

    #[error("option {option_id} was not offered for session {session_id}")]
    UnknownPermissionOption {
        session_id: SessionId,
        option_id: String,
    },

    #[error("client has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Errors caused by the transport rather than the server's answer.
    /// Retrying after a reconnect may succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::NotConnected
                | ClientError::ConnectionLost
                | ClientError::Timeout { .. }
        )
    }
}

impl From<RpcErrorPayload> for ClientError {
    fn from(payload: RpcErrorPayload) -> Self {
        ClientError::Rpc {
            code: payload.code,
            message: payload.message,
            data: payload.data,
        }
    }
}
