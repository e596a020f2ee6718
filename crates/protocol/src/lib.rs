//! Aerolink Protocol
//!
//! Shared types for communication between Aerolink clients and session servers.
//! Every frame is a single JSON [`WireMessage`] sent over a persistent socket.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;
pub mod wire;

pub use client::*;
pub use server::*;
pub use types::*;
pub use wire::{RequestId, RpcErrorPayload, WireMessage};

/// Version negotiated during the `initialize` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Method names for requests (client → server unless noted).
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const CREATE_SESSION: &str = "create_session";
    pub const RESUME_SESSION: &str = "resume_session";
    pub const FORK_SESSION: &str = "fork_session";
    pub const LIST_SESSIONS: &str = "list_sessions";
    pub const GET_SESSION_INFO: &str = "get_session_info";
    pub const SUBSCRIBE_SESSION: &str = "subscribe_session";
    pub const UNSUBSCRIBE_SESSION: &str = "unsubscribe_session";
    pub const GET_SESSION_STATE: &str = "get_session_state";
    pub const SET_SESSION_MODEL: &str = "set_session_model";
    pub const SET_SESSION_MODE: &str = "set_session_mode";
    pub const PROMPT: &str = "prompt";
    pub const CANCEL_SESSION: &str = "cancel_session";

    pub const LIST_DIRECTORY: &str = "list_directory";
    pub const READ_FILE: &str = "read_file";
    pub const WRITE_FILE: &str = "write_file";
    pub const CREATE_FILE: &str = "create_file";
    pub const CREATE_DIRECTORY: &str = "create_directory";
    pub const DELETE_PATH: &str = "delete_path";
    pub const RENAME_PATH: &str = "rename_path";

    pub const CREATE_TERMINAL: &str = "create_terminal";
    pub const WRITE_TERMINAL: &str = "write_terminal";
    pub const RESIZE_TERMINAL: &str = "resize_terminal";
    pub const KILL_TERMINAL: &str = "kill_terminal";
    pub const LIST_TERMINALS: &str = "list_terminals";

    /// Server → client: the agent needs a decision before running a tool.
    pub const REQUEST_PERMISSION: &str = "session/request_permission";
}

/// Notification topics pushed by the server.
pub mod topic {
    pub const SESSION_UPDATE: &str = "session/update";
    pub const SESSION_ACTIVATED: &str = "session/activated";
    pub const TERMINAL_OUTPUT: &str = "terminal/output";
    pub const TERMINAL_EXIT: &str = "terminal/exit";
}

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
