//! Server → Client notification payloads and server-initiated requests

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Payload of a `session/update` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdateNotification {
    pub session_id: SessionId,
    pub update: SessionUpdate,
}

/// Incremental change to one session's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionUpdate {
    // Transcript
    ItemAppended {
        item: ChatItem,
    },
    ItemUpdated {
        item_id: String,
        patch: ItemPatch,
    },

    // Session settings
    ModelChanged {
        current_model_id: String,
    },
    ModelsUpdated {
        models: SessionModelState,
    },
    ModeChanged {
        current_mode_id: String,
    },
    DangerousModeChanged {
        enabled: bool,
    },
    PromptStateChanged {
        in_flight: bool,
    },

    /// Server-forced resync; replaces the whole state
    StateReset {
        state: SessionState,
    },
}

/// Payload of a `session/activated` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionActivatedNotification {
    pub session_id: SessionId,
}

/// Payload of a `terminal/output` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutputNotification {
    pub terminal_id: String,
    pub data: String,
}

/// Payload of a `terminal/exit` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalExitNotification {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Params of the `session/request_permission` server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequestParams {
    pub session_id: SessionId,
    pub tool_call: ToolCall,
    pub options: Vec<PermissionOption>,
}

/// Client's answer to `session/request_permission`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub outcome: PermissionOutcome,
}
