//! Client → Server request params and their responses

use serde::{Deserialize, Serialize};

use crate::types::*;

// -- Handshake ---------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Client answers `session/request_permission`
    #[serde(default)]
    pub permissions: bool,
    /// Client consumes `terminal/output` pushes
    #[serde(default)]
    pub terminal_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_info: ClientInfo,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub resume_session: bool,
    #[serde(default)]
    pub fork_session: bool,
    #[serde(default)]
    pub files: bool,
    #[serde(default)]
    pub terminals: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
}

// -- Sessions ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionParams {
    pub cwd: String,
}

/// Params for `resume_session` and `fork_session`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCwdParams {
    pub session_id: SessionId,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionResponse {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<SessionModeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<SessionModelState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSessionsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListSessionsParams {
    fn default() -> Self {
        Self {
            cwd: None,
            limit: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionInfo>,
    pub has_more: bool,
    pub total: usize,
}

/// Params for every method that only names a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdParams {
    pub session_id: SessionId,
}

impl SessionIdParams {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSessionModelParams {
    pub session_id: SessionId,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSessionModeParams {
    pub session_id: SessionId,
    pub mode_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptParams {
    pub session_id: SessionId,
    /// Client-generated ID; the server echoes the user message with it
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

// -- Files -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDirectoryResponse {
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadFileResponse {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFileParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenamePathParams {
    pub from: String,
    pub to: String,
}

// -- Terminals ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTerminalParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for CreateTerminalParams {
    fn default() -> Self {
        Self {
            cwd: None,
            shell: None,
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTerminalResponse {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteTerminalParams {
    pub terminal_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeTerminalParams {
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalIdParams {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListTerminalsResponse {
    pub terminals: Vec<TerminalInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_sessions_params_omit_missing_cwd() {
        let value = serde_json::to_value(ListSessionsParams::default()).expect("serialize");
        assert_eq!(value, json!({"limit": 20, "offset": 0}));
    }

    #[test]
    fn new_session_response_without_modes_or_models() {
        let response: NewSessionResponse =
            serde_json::from_value(json!({"session_id": "abc123"})).expect("deserialize");
        assert_eq!(response.session_id, "abc123");
        assert!(response.modes.is_none());
        assert!(response.models.is_none());
    }

    #[test]
    fn initialize_response_tolerates_sparse_capabilities() {
        let response: InitializeResponse = serde_json::from_value(json!({
            "protocol_version": 1,
            "capabilities": {"files": true}
        }))
        .expect("deserialize");
        assert!(response.capabilities.files);
        assert!(!response.capabilities.terminals);
        assert!(response.server_info.is_none());
    }
}
