//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type SessionId = String;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A text message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Lifecycle of a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A tool invocation made by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Agent reasoning shown separately from the reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub id: String,
    pub content: String,
}

/// One entry of a session's chat transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatItem {
    Message(Message),
    ToolCall(ToolCall),
    Thought(Thought),
}

impl ChatItem {
    pub fn id(&self) -> &str {
        match self {
            ChatItem::Message(message) => &message.id,
            ChatItem::ToolCall(call) => &call.id,
            ChatItem::Thought(thought) => &thought.id,
        }
    }

    /// Apply an in-place delta. Fields that don't exist on this kind of item
    /// are ignored.
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        match self {
            ChatItem::Message(Message { content, .. })
            | ChatItem::Thought(Thought { content, .. }) => {
                if let Some(replacement) = &patch.content {
                    content.clone_from(replacement);
                }
                if let Some(delta) = &patch.append_text {
                    content.push_str(delta);
                }
            }
            ChatItem::ToolCall(call) => {
                if let Some(title) = &patch.content {
                    call.title.clone_from(title);
                }
                if let Some(status) = patch.status {
                    call.status = status;
                }
                if let Some(output) = &patch.output {
                    call.output = Some(output.clone());
                }
                if let Some(delta) = &patch.append_output {
                    call.output.get_or_insert_with(String::new).push_str(delta);
                }
            }
        }
    }
}

/// Changes to apply to a chat item (delta updates)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    /// Streaming text delta appended to a message or thought
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_text: Option<String>,
    /// Full replacement text (tool call title for tool calls)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModelState {
    pub available_models: Vec<ModelInfo>,
    pub current_model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMode {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModeState {
    pub available_modes: Vec<SessionMode>,
    pub current_mode_id: String,
}

/// Summary of a session (active or historical) for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub summary: String,
    pub message_count: u32,
    /// ISO 8601
    pub last_activity: String,
    pub cwd: String,
    /// Connected to an agent right now
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assistant_message: Option<String>,
}

/// Full session state, as returned by `subscribe_session` and `get_session_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub chat_items: Vec<ChatItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<SessionModelState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<SessionModeState>,
    #[serde(default)]
    pub dangerous_mode: bool,
    #[serde(default)]
    pub prompt_in_flight: bool,
}

impl SessionState {
    pub fn empty(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: None,
            chat_items: Vec::new(),
            models: None,
            modes: None,
            dangerous_mode: false,
            prompt_in_flight: false,
        }
    }
}

/// Why a prompt turn finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    pub fn is_allow(self) -> bool {
        matches!(
            self,
            PermissionOptionKind::AllowOnce | PermissionOptionKind::AllowAlways
        )
    }
}

/// A choice offered with a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

/// How a permission request was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Selected { option_id: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}
