//! Frame envelope shared by both directions of the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RequestId = u64;

/// One JSON frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Request {
        id: RequestId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcErrorPayload>,
    },
    Notification {
        topic: String,
        #[serde(default)]
        payload: Value,
    },
}

impl WireMessage {
    pub fn request(
        id: RequestId,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(WireMessage::Request {
            id,
            method: method.into(),
            params: serde_json::to_value(params)?,
        })
    }

    pub fn notification(
        topic: impl Into<String>,
        payload: impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(WireMessage::Notification {
            topic: topic.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        WireMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: RpcErrorPayload) -> Self {
        WireMessage::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build a response frame from a handler outcome.
    pub fn response(id: RequestId, outcome: Result<Value, RpcErrorPayload>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorPayload {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}
