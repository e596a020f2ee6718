//! Session state reconciliation.
//!
//! Pure merge functions over a [`SessionSnapshot`]: install a server baseline,
//! apply an incremental update, insert an optimistic local message, mark one
//! failed. No locks, no I/O. Each returns the [`SessionChange`] it made so the
//! store can broadcast it.
//!
//! Chat entries are reconciled by item ID: a server item whose ID matches an
//! optimistic entry replaces it in place instead of appending a duplicate.

use std::collections::{HashMap, HashSet};

use aerolink_protocol::{
    ChatItem, Message, MessageRole, SessionId, SessionModeState, SessionModelState, SessionState,
    SessionUpdate,
};
use tracing::debug;

/// Where a chat entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Added locally, not yet echoed by the server.
    Optimistic,
    /// Received from the server.
    Confirmed,
    /// Added locally; the request that should have confirmed it failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub item: ChatItem,
    pub origin: EntryOrigin,
}

impl ChatEntry {
    pub fn id(&self) -> &str {
        self.item.id()
    }
}

/// Client-side view of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub cwd: Option<String>,
    pub entries: Vec<ChatEntry>,
    pub models: Option<SessionModelState>,
    pub modes: Option<SessionModeState>,
    pub dangerous_mode: bool,
    pub prompt_in_flight: bool,
    /// A server baseline has been installed at least once.
    pub synced: bool,
    /// Bumped on every change.
    pub revision: u64,
    index: HashMap<String, usize>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: None,
            entries: Vec::new(),
            models: None,
            modes: None,
            dangerous_mode: false,
            prompt_in_flight: false,
            synced: false,
            revision: 0,
            index: HashMap::new(),
        }
    }

    pub fn entry(&self, item_id: &str) -> Option<&ChatEntry> {
        self.index.get(item_id).map(|&at| &self.entries[at])
    }

    pub fn items(&self) -> impl Iterator<Item = &ChatItem> {
        self.entries.iter().map(|entry| &entry.item)
    }

    pub fn current_model_id(&self) -> Option<&str> {
        self.models
            .as_ref()
            .map(|models| models.current_model_id.as_str())
    }

    pub fn current_mode_id(&self) -> Option<&str> {
        self.modes.as_ref().map(|modes| modes.current_mode_id.as_str())
    }

    fn push(&mut self, entry: ChatEntry) {
        self.index.insert(entry.id().to_string(), self.entries.len());
        self.entries.push(entry);
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(at, entry)| (entry.id().to_string(), at))
            .collect();
    }
}

/// What a merge step changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Baseline,
    Reset,
    ItemAppended { item_id: String },
    /// A server item replaced the optimistic entry with the same ID.
    ItemConfirmed { item_id: String },
    ItemUpdated { item_id: String },
    ItemFailed { item_id: String },
    ModelChanged,
    ModeChanged,
    DangerousModeChanged { enabled: bool },
    PromptStateChanged { in_flight: bool },
}

/// Broadcast to session watchers after every applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub revision: u64,
    pub change: SessionChange,
}

/// Replace the snapshot with a server baseline.
///
/// Local entries the server has not confirmed yet survive, appended after
/// the baseline items, unless the baseline already contains their ID.
pub fn install_baseline(snapshot: &mut SessionSnapshot, state: SessionState) -> SessionChange {
    let SessionState {
        session_id: _,
        cwd,
        chat_items,
        models,
        modes,
        dangerous_mode,
        prompt_in_flight,
    } = state;

    let unconfirmed: Vec<ChatEntry> = {
        let confirmed_ids: HashSet<&str> = chat_items.iter().map(|item| item.id()).collect();
        snapshot
            .entries
            .iter()
            .filter(|entry| {
                entry.origin != EntryOrigin::Confirmed && !confirmed_ids.contains(entry.id())
            })
            .cloned()
            .collect()
    };

    let mut entries: Vec<ChatEntry> = chat_items
        .into_iter()
        .map(|item| ChatEntry {
            item,
            origin: EntryOrigin::Confirmed,
        })
        .collect();
    entries.extend(unconfirmed);

    if cwd.is_some() {
        snapshot.cwd = cwd;
    }
    snapshot.entries = entries;
    snapshot.models = models;
    snapshot.modes = modes;
    snapshot.dangerous_mode = dangerous_mode;
    snapshot.prompt_in_flight = prompt_in_flight;
    snapshot.synced = true;
    snapshot.revision += 1;
    snapshot.reindex();
    SessionChange::Baseline
}

/// Apply one incremental update. `None` when the update was ignored.
pub fn apply_update(snapshot: &mut SessionSnapshot, update: SessionUpdate) -> Option<SessionChange> {
    let change = match update {
        SessionUpdate::ItemAppended { item } => {
            let item_id = item.id().to_string();
            match snapshot.index.get(&item_id).copied() {
                Some(at) => {
                    let entry = &mut snapshot.entries[at];
                    let was_local = entry.origin != EntryOrigin::Confirmed;
                    entry.item = item;
                    entry.origin = EntryOrigin::Confirmed;
                    if was_local {
                        SessionChange::ItemConfirmed { item_id }
                    } else {
                        SessionChange::ItemUpdated { item_id }
                    }
                }
                None => {
                    snapshot.push(ChatEntry {
                        item,
                        origin: EntryOrigin::Confirmed,
                    });
                    SessionChange::ItemAppended { item_id }
                }
            }
        }
        SessionUpdate::ItemUpdated { item_id, patch } => {
            let Some(at) = snapshot.index.get(&item_id).copied() else {
                debug!(
                    component = "session_state",
                    event = "session_state.update.unknown_item",
                    session_id = %snapshot.session_id,
                    item_id = %item_id,
                    "Ignoring patch for unknown item"
                );
                return None;
            };
            snapshot.entries[at].item.apply_patch(&patch);
            SessionChange::ItemUpdated { item_id }
        }
        SessionUpdate::ModelChanged { current_model_id } => {
            match snapshot.models.as_mut() {
                Some(models) => models.current_model_id = current_model_id,
                None => {
                    snapshot.models = Some(SessionModelState {
                        available_models: Vec::new(),
                        current_model_id,
                    })
                }
            }
            SessionChange::ModelChanged
        }
        SessionUpdate::ModelsUpdated { models } => {
            snapshot.models = Some(models);
            SessionChange::ModelChanged
        }
        SessionUpdate::ModeChanged { current_mode_id } => {
            match snapshot.modes.as_mut() {
                Some(modes) => modes.current_mode_id = current_mode_id,
                None => {
                    snapshot.modes = Some(SessionModeState {
                        available_modes: Vec::new(),
                        current_mode_id,
                    })
                }
            }
            SessionChange::ModeChanged
        }
        SessionUpdate::DangerousModeChanged { enabled } => {
            snapshot.dangerous_mode = enabled;
            SessionChange::DangerousModeChanged { enabled }
        }
        SessionUpdate::PromptStateChanged { in_flight } => {
            snapshot.prompt_in_flight = in_flight;
            SessionChange::PromptStateChanged { in_flight }
        }
        SessionUpdate::StateReset { state } => {
            install_baseline(snapshot, state);
            return Some(SessionChange::Reset);
        }
    };
    snapshot.revision += 1;
    Some(change)
}

/// Append a local user message awaiting server confirmation.
pub fn insert_optimistic(snapshot: &mut SessionSnapshot, message: Message) -> SessionChange {
    let item_id = message.id.clone();
    if let Some(&at) = snapshot.index.get(&item_id) {
        // Same ID already present; keep whichever the server confirmed.
        if snapshot.entries[at].origin == EntryOrigin::Confirmed {
            return SessionChange::ItemConfirmed { item_id };
        }
        snapshot.entries[at].item = ChatItem::Message(message);
        snapshot.entries[at].origin = EntryOrigin::Optimistic;
    } else {
        snapshot.push(ChatEntry {
            item: ChatItem::Message(message),
            origin: EntryOrigin::Optimistic,
        });
    }
    snapshot.revision += 1;
    SessionChange::ItemAppended { item_id }
}

/// Mark an optimistic entry as failed. Confirmed entries are left alone.
pub fn mark_failed(snapshot: &mut SessionSnapshot, item_id: &str) -> Option<SessionChange> {
    let at = *snapshot.index.get(item_id)?;
    let entry = &mut snapshot.entries[at];
    if entry.origin != EntryOrigin::Optimistic {
        return None;
    }
    entry.origin = EntryOrigin::Failed;
    snapshot.revision += 1;
    Some(SessionChange::ItemFailed {
        item_id: item_id.to_string(),
    })
}

/// Build the optimistic user message for `content`.
pub fn user_message(id: impl Into<String>, content: impl Into<String>) -> Message {
    Message {
        id: id.into(),
        role: MessageRole::User,
        content: content.into(),
        timestamp: now_millis(),
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerolink_protocol::{ItemPatch, ModelInfo, ToolCall, ToolCallStatus};

    fn server_message(id: &str, role: MessageRole, content: &str) -> ChatItem {
        ChatItem::Message(Message {
            id: id.to_string(),
            role,
            content: content.to_string(),
            timestamp: 1,
        })
    }

    fn content_of(snapshot: &SessionSnapshot, id: &str) -> String {
        match &snapshot.entry(id).expect("entry").item {
            ChatItem::Message(message) => message.content.clone(),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn optimistic_then_confirmed_is_one_item() {
        let mut snapshot = SessionSnapshot::new("s1");
        insert_optimistic(&mut snapshot, user_message("X", "hello"));
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].origin, EntryOrigin::Optimistic);

        let change = apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: server_message("X", MessageRole::User, "hello"),
            },
        );
        assert_eq!(
            change,
            Some(SessionChange::ItemConfirmed {
                item_id: "X".into()
            })
        );
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].origin, EntryOrigin::Confirmed);
    }

    #[test]
    fn baseline_keeps_unconfirmed_local_entries() {
        let mut snapshot = SessionSnapshot::new("s1");
        insert_optimistic(&mut snapshot, user_message("local-1", "pending"));
        insert_optimistic(&mut snapshot, user_message("m2", "echoed"));

        let mut state = SessionState::empty("s1");
        state.chat_items = vec![
            server_message("m1", MessageRole::Assistant, "hi"),
            server_message("m2", MessageRole::User, "echoed"),
        ];
        state.prompt_in_flight = true;
        install_baseline(&mut snapshot, state);

        let ids: Vec<&str> = snapshot.entries.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["m1", "m2", "local-1"]);
        assert_eq!(snapshot.entry("m2").expect("m2").origin, EntryOrigin::Confirmed);
        assert_eq!(
            snapshot.entry("local-1").expect("local").origin,
            EntryOrigin::Optimistic
        );
        assert!(snapshot.synced);
        assert!(snapshot.prompt_in_flight);
    }

    #[test]
    fn streaming_patches_and_unknown_ids() {
        let mut snapshot = SessionSnapshot::new("s1");
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: server_message("a1", MessageRole::Assistant, "Hel"),
            },
        );
        let change = apply_update(
            &mut snapshot,
            SessionUpdate::ItemUpdated {
                item_id: "a1".into(),
                patch: ItemPatch {
                    append_text: Some("lo".into()),
                    ..Default::default()
                },
            },
        );
        assert_eq!(
            change,
            Some(SessionChange::ItemUpdated {
                item_id: "a1".into()
            })
        );
        assert_eq!(content_of(&snapshot, "a1"), "Hello");

        let revision = snapshot.revision;
        let ignored = apply_update(
            &mut snapshot,
            SessionUpdate::ItemUpdated {
                item_id: "ghost".into(),
                patch: ItemPatch::default(),
            },
        );
        assert!(ignored.is_none());
        assert_eq!(snapshot.revision, revision);
    }

    #[test]
    fn tool_call_lifecycle() {
        let mut snapshot = SessionSnapshot::new("s1");
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: ChatItem::ToolCall(ToolCall {
                    id: "t1".into(),
                    title: "cargo test".into(),
                    kind: Some("execute".into()),
                    status: ToolCallStatus::Pending,
                    raw_input: None,
                    output: None,
                }),
            },
        );
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemUpdated {
                item_id: "t1".into(),
                patch: ItemPatch {
                    status: Some(ToolCallStatus::Completed),
                    output: Some("ok".into()),
                    ..Default::default()
                },
            },
        );
        match &snapshot.entry("t1").expect("t1").item {
            ChatItem::ToolCall(call) => {
                assert_eq!(call.status, ToolCallStatus::Completed);
                assert_eq!(call.output.as_deref(), Some("ok"));
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn settings_updates() {
        let mut snapshot = SessionSnapshot::new("s1");
        apply_update(
            &mut snapshot,
            SessionUpdate::ModelsUpdated {
                models: SessionModelState {
                    available_models: vec![ModelInfo {
                        model_id: "sonnet".into(),
                        name: "Sonnet".into(),
                        description: None,
                    }],
                    current_model_id: "sonnet".into(),
                },
            },
        );
        apply_update(
            &mut snapshot,
            SessionUpdate::ModelChanged {
                current_model_id: "opus".into(),
            },
        );
        apply_update(
            &mut snapshot,
            SessionUpdate::ModeChanged {
                current_mode_id: "plan".into(),
            },
        );
        apply_update(
            &mut snapshot,
            SessionUpdate::DangerousModeChanged { enabled: true },
        );

        assert_eq!(snapshot.current_model_id(), Some("opus"));
        assert_eq!(
            snapshot.models.as_ref().map(|m| m.available_models.len()),
            Some(1)
        );
        assert_eq!(snapshot.current_mode_id(), Some("plan"));
        assert!(snapshot.dangerous_mode);
        assert_eq!(snapshot.revision, 4);
    }

    #[test]
    fn failed_entries_stay_visible_and_only_optimistic_can_fail() {
        let mut snapshot = SessionSnapshot::new("s1");
        insert_optimistic(&mut snapshot, user_message("X", "hello"));
        assert!(mark_failed(&mut snapshot, "X").is_some());
        assert_eq!(snapshot.entry("X").expect("X").origin, EntryOrigin::Failed);
        assert!(mark_failed(&mut snapshot, "X").is_none());
        assert!(mark_failed(&mut snapshot, "missing").is_none());

        // A late confirmation still wins over the failure.
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: server_message("X", MessageRole::User, "hello"),
            },
        );
        assert_eq!(snapshot.entry("X").expect("X").origin, EntryOrigin::Confirmed);
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[test]
    fn state_reset_replaces_everything_but_pending_local() {
        let mut snapshot = SessionSnapshot::new("s1");
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: server_message("old", MessageRole::Assistant, "stale"),
            },
        );
        insert_optimistic(&mut snapshot, user_message("local", "typing"));

        let mut state = SessionState::empty("s1");
        state.chat_items = vec![server_message("new", MessageRole::Assistant, "fresh")];
        let change = apply_update(&mut snapshot, SessionUpdate::StateReset { state });
        assert_eq!(change, Some(SessionChange::Reset));

        let ids: Vec<&str> = snapshot.entries.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["new", "local"]);
        assert!(snapshot.entry("old").is_none());
    }
}
