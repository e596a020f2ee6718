//! Typed facades over the file and terminal RPCs.
//!
//! The client only relays these calls; the server performs the file-system
//! and process work.

use aerolink_protocol::{
    method, topic, CreateFileParams, CreateTerminalParams, CreateTerminalResponse, FileEntry,
    ListDirectoryResponse, ListTerminalsResponse, PathParams, ReadFileResponse,
    RenamePathParams, ResizeTerminalParams, TerminalExitNotification, TerminalIdParams,
    TerminalInfo, TerminalOutputNotification, WriteFileParams, WriteTerminalParams,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::rpc::{RpcDispatcher, Unsubscribe};

#[derive(Clone)]
pub struct FileService {
    rpc: RpcDispatcher,
}

impl FileService {
    pub fn new(rpc: RpcDispatcher) -> Self {
        Self { rpc }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>> {
        let response: ListDirectoryResponse = self
            .rpc
            .request(method::LIST_DIRECTORY, path_params(path))
            .await?;
        Ok(response.entries)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let response: ReadFileResponse =
            self.rpc.request(method::READ_FILE, path_params(path)).await?;
        Ok(response.content)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::WRITE_FILE,
                WriteFileParams {
                    path: path.to_string(),
                    content: content.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn create_file(&self, path: &str, content: Option<&str>) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::CREATE_FILE,
                CreateFileParams {
                    path: path.to_string(),
                    content: content.map(str::to_string),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(method::CREATE_DIRECTORY, path_params(path))
            .await?;
        Ok(())
    }

    pub async fn delete_path(&self, path: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(method::DELETE_PATH, path_params(path))
            .await?;
        Ok(())
    }

    pub async fn rename_path(&self, from: &str, to: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::RENAME_PATH,
                RenamePathParams {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

fn path_params(path: &str) -> PathParams {
    PathParams {
        path: path.to_string(),
    }
}

#[derive(Clone)]
pub struct TerminalService {
    rpc: RpcDispatcher,
}

impl TerminalService {
    pub fn new(rpc: RpcDispatcher) -> Self {
        Self { rpc }
    }

    pub async fn create_terminal(&self, params: CreateTerminalParams) -> Result<String> {
        let response: CreateTerminalResponse =
            self.rpc.request(method::CREATE_TERMINAL, params).await?;
        Ok(response.terminal_id)
    }

    pub async fn write_terminal(&self, terminal_id: &str, data: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::WRITE_TERMINAL,
                WriteTerminalParams {
                    terminal_id: terminal_id.to_string(),
                    data: data.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn resize_terminal(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::RESIZE_TERMINAL,
                ResizeTerminalParams {
                    terminal_id: terminal_id.to_string(),
                    cols,
                    rows,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn kill_terminal(&self, terminal_id: &str) -> Result<()> {
        let _: Value = self
            .rpc
            .request(
                method::KILL_TERMINAL,
                TerminalIdParams {
                    terminal_id: terminal_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_terminals(&self) -> Result<Vec<TerminalInfo>> {
        let response: ListTerminalsResponse = self
            .rpc
            .request(method::LIST_TERMINALS, serde_json::json!({}))
            .await?;
        Ok(response.terminals)
    }

    /// Stream output and exit notifications for one terminal. Register before
    /// writing to the terminal so no output is missed.
    pub fn attach(&self, terminal_id: &str) -> TerminalStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let output = self.rpc.on(topic::TERMINAL_OUTPUT, {
            let events_tx = events_tx.clone();
            let terminal_id = terminal_id.to_string();
            move |notification| {
                match serde_json::from_value::<TerminalOutputNotification>(
                    notification.payload.clone(),
                ) {
                    Ok(output) if output.terminal_id == terminal_id => {
                        let _ = events_tx.send(TerminalEvent::Output(output.data));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        component = "terminals",
                        event = "terminals.output.decode_failed",
                        error = %e,
                        "Malformed terminal output notification"
                    ),
                }
            }
        });

        let exit = self.rpc.on(topic::TERMINAL_EXIT, {
            let terminal_id = terminal_id.to_string();
            move |notification| {
                match serde_json::from_value::<TerminalExitNotification>(
                    notification.payload.clone(),
                ) {
                    Ok(exit) if exit.terminal_id == terminal_id => {
                        let _ = events_tx.send(TerminalEvent::Exited {
                            exit_code: exit.exit_code,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        component = "terminals",
                        event = "terminals.exit.decode_failed",
                        error = %e,
                        "Malformed terminal exit notification"
                    ),
                }
            }
        });

        TerminalStream {
            terminal_id: terminal_id.to_string(),
            events: events_rx,
            handlers: vec![output, exit],
            finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(String),
    Exited { exit_code: Option<i32> },
}

/// Live output of one terminal. Dropping it unregisters its handlers.
pub struct TerminalStream {
    terminal_id: String,
    events: mpsc::UnboundedReceiver<TerminalEvent>,
    handlers: Vec<Unsubscribe>,
    finished: bool,
}

impl TerminalStream {
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Next event; `None` after the terminal exited.
    pub async fn next(&mut self) -> Option<TerminalEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await?;
        if matches!(event, TerminalEvent::Exited { .. }) {
            self.finished = true;
            self.unregister();
        }
        Some(event)
    }

    fn unregister(&mut self) {
        for handler in self.handlers.drain(..) {
            handler.unsubscribe();
        }
    }
}

impl Drop for TerminalStream {
    fn drop(&mut self) {
        self.unregister();
    }
}
