//! Per-session state cells.
//!
//! Each cell holds a mutex-guarded master [`SessionSnapshot`], a published copy
//! behind `ArcSwap` for lock-free reads, and a broadcast channel of
//! [`SessionEvent`]s. Merging is delegated to [`crate::session_state`].
//!
//! While a baseline fetch is in flight the cell buffers updates together with
//! their inbound sequence number. Installing a baseline fetched at sequence
//! `S` replays the buffered updates with sequence greater than `S`, in order.

use std::sync::Arc;

use aerolink_protocol::{new_id, NewSessionResponse, SessionId, SessionState, SessionUpdate};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::session_state::{
    self, user_message, SessionChange, SessionEvent, SessionSnapshot,
};

const EVENT_CHANNEL_CAPACITY: usize = 512;

struct CellState {
    snapshot: SessionSnapshot,
    syncs_in_flight: u32,
    /// Inbound sequence of the installed baseline.
    baseline_seq: u64,
    buffered: Vec<(u64, SessionUpdate)>,
}

struct SessionCell {
    master: Mutex<CellState>,
    published: ArcSwap<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCell {
    fn new(session_id: &str) -> Self {
        let snapshot = SessionSnapshot::new(session_id);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            published: ArcSwap::from_pointee(snapshot.clone()),
            master: Mutex::new(CellState {
                snapshot,
                syncs_in_flight: 0,
                baseline_seq: 0,
                buffered: Vec::new(),
            }),
            events,
        }
    }

    /// Publish the master snapshot and announce `changes`. Called with the
    /// master lock held so readers never observe publishes out of order.
    fn commit(&self, state: &CellState, changes: Vec<SessionChange>) {
        if changes.is_empty() {
            return;
        }
        self.published.store(Arc::new(state.snapshot.clone()));
        for change in changes {
            let _ = self.events.send(SessionEvent {
                session_id: state.snapshot.session_id.clone(),
                revision: state.snapshot.revision,
                change,
            });
        }
    }
}

#[derive(Default)]
pub struct SessionStore {
    cells: DashMap<SessionId, Arc<SessionCell>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, session_id: &str) -> Arc<SessionCell> {
        if let Some(cell) = self.cells.get(session_id) {
            return Arc::clone(cell.value());
        }
        self.cells
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionCell::new(session_id)))
            .value()
            .clone()
    }

    /// Lock-free read of the latest published snapshot.
    pub fn snapshot(&self, session_id: &str) -> Option<Arc<SessionSnapshot>> {
        self.cells
            .get(session_id)
            .map(|cell| cell.published.load_full())
    }

    /// Change feed for one session. Creates the cell if needed.
    pub fn events(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.cell(session_id).events.subscribe()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.cells.iter().map(|cell| cell.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn forget(&self, session_id: &str) {
        self.cells.remove(session_id);
    }

    // -- Baseline ------------------------------------------------------------

    /// Start buffering updates ahead of a baseline fetch.
    pub fn begin_sync(&self, session_id: &str) {
        let cell = self.cell(session_id);
        let mut state = cell.master.lock();
        state.syncs_in_flight += 1;
    }

    /// Install a baseline fetched at inbound sequence `seq`, then replay the
    /// buffered updates that arrived after it.
    pub fn install_baseline(&self, session_id: &str, baseline: SessionState, seq: u64) {
        let cell = self.cell(session_id);
        let mut state = cell.master.lock();
        state.syncs_in_flight = state.syncs_in_flight.saturating_sub(1);

        let mut changes = Vec::new();
        if seq < state.baseline_seq {
            debug!(
                component = "sessions",
                event = "sessions.baseline.stale",
                session_id = %session_id,
                seq,
                installed_seq = state.baseline_seq,
                "Ignoring baseline older than the installed one"
            );
        } else {
            state.baseline_seq = seq;
            state.buffered.retain(|(update_seq, _)| *update_seq > seq);
            changes.push(session_state::install_baseline(&mut state.snapshot, baseline));

            let replay: Vec<SessionUpdate> = state
                .buffered
                .iter()
                .map(|(_, update)| update.clone())
                .collect();
            let replayed = replay.len();
            for update in replay {
                changes.extend(session_state::apply_update(&mut state.snapshot, update));
            }
            debug!(
                component = "sessions",
                event = "sessions.baseline.installed",
                session_id = %session_id,
                seq,
                items = state.snapshot.entries.len(),
                replayed,
                "Baseline installed"
            );
        }

        if state.syncs_in_flight == 0 {
            state.buffered.clear();
        }
        cell.commit(&state, changes);
    }

    /// A baseline fetch failed. Buffered updates are not dropped: if no
    /// baseline was ever installed they are applied now.
    pub fn abort_sync(&self, session_id: &str) {
        let cell = self.cell(session_id);
        let mut state = cell.master.lock();
        state.syncs_in_flight = state.syncs_in_flight.saturating_sub(1);
        if state.syncs_in_flight > 0 {
            return;
        }
        let buffered = std::mem::take(&mut state.buffered);
        let mut changes = Vec::new();
        if !state.snapshot.synced {
            for (_, update) in buffered {
                changes.extend(session_state::apply_update(&mut state.snapshot, update));
            }
        }
        cell.commit(&state, changes);
    }

    // -- Updates -------------------------------------------------------------

    /// Route one `session/update` carried by inbound frame `seq`.
    pub fn handle_update(&self, session_id: &str, update: SessionUpdate, seq: u64) {
        let cell = self.cell(session_id);
        let mut state = cell.master.lock();

        if seq <= state.baseline_seq {
            debug!(
                component = "sessions",
                event = "sessions.update.stale",
                session_id = %session_id,
                seq,
                "Ignoring update already covered by the baseline"
            );
            return;
        }

        if state.syncs_in_flight > 0 {
            state.buffered.push((seq, update.clone()));
            // A never-synced cell waits for its baseline; a resyncing one
            // keeps showing live changes and replays them onto the baseline.
            if !state.snapshot.synced {
                return;
            }
        }

        let changes: Vec<SessionChange> =
            session_state::apply_update(&mut state.snapshot, update).into_iter().collect();
        cell.commit(&state, changes);
    }

    /// Record what `create/resume/fork_session` returned, ahead of any
    /// subscription.
    pub fn seed(&self, response: &NewSessionResponse, cwd: &str) {
        let cell = self.cell(&response.session_id);
        let mut state = cell.master.lock();
        let snapshot = &mut state.snapshot;
        snapshot.cwd = Some(cwd.to_string());
        if let Some(models) = &response.models {
            snapshot.models = Some(models.clone());
        }
        if let Some(modes) = &response.modes {
            snapshot.modes = Some(modes.clone());
        }
        snapshot.revision += 1;
        cell.commit(&state, vec![SessionChange::ModelChanged, SessionChange::ModeChanged]);
    }

    // -- Optimistic ----------------------------------------------------------

    /// Append a local user message and return its fresh ID.
    pub fn add_optimistic_message(&self, session_id: &str, content: &str) -> String {
        let message_id = new_id();
        self.insert_optimistic(session_id, &message_id, content);
        message_id
    }

    pub fn insert_optimistic(&self, session_id: &str, message_id: &str, content: &str) {
        let cell = self.cell(session_id);
        let mut state = cell.master.lock();
        let change =
            session_state::insert_optimistic(&mut state.snapshot, user_message(message_id, content));
        cell.commit(&state, vec![change]);
    }

    pub fn mark_failed(&self, session_id: &str, message_id: &str) -> bool {
        let Some(cell) = self.cells.get(session_id).map(|cell| Arc::clone(cell.value())) else {
            return false;
        };
        let mut state = cell.master.lock();
        match session_state::mark_failed(&mut state.snapshot, message_id) {
            Some(change) => {
                cell.commit(&state, vec![change]);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_state::EntryOrigin;
    use aerolink_protocol::{ChatItem, ItemPatch, Message, MessageRole};

    fn appended(id: &str, content: &str) -> SessionUpdate {
        SessionUpdate::ItemAppended {
            item: ChatItem::Message(Message {
                id: id.into(),
                role: MessageRole::Assistant,
                content: content.into(),
                timestamp: 0,
            }),
        }
    }

    fn baseline_with(ids: &[&str]) -> SessionState {
        let mut state = SessionState::empty("s1");
        state.chat_items = ids
            .iter()
            .map(|id| ChatItem::Message(Message {
                id: id.to_string(),
                role: MessageRole::Assistant,
                content: String::new(),
                timestamp: 0,
            }))
            .collect();
        state
    }

    fn ids(store: &SessionStore) -> Vec<String> {
        store
            .snapshot("s1")
            .expect("snapshot")
            .entries
            .iter()
            .map(|entry| entry.id().to_string())
            .collect()
    }

    #[test]
    fn updates_racing_a_baseline_are_replayed_not_lost() {
        let store = SessionStore::new();
        store.begin_sync("s1");

        // seq 1 is already part of the baseline; seq 3 arrived after it.
        store.handle_update("s1", appended("a", ""), 1);
        store.handle_update("s1", appended("c", ""), 3);
        assert!(ids(&store).is_empty(), "nothing visible before the baseline");

        store.install_baseline("s1", baseline_with(&["a", "b"]), 2);
        assert_eq!(ids(&store), vec!["a", "b", "c"]);

        // Later updates apply directly.
        store.handle_update(
            "s1",
            SessionUpdate::ItemUpdated {
                item_id: "c".into(),
                patch: ItemPatch {
                    append_text: Some("done".into()),
                    ..Default::default()
                },
            },
            4,
        );
        let snapshot = store.snapshot("s1").expect("snapshot");
        match &snapshot.entry("c").expect("c").item {
            ChatItem::Message(message) => assert_eq!(message.content, "done"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn resync_keeps_live_updates_and_ignores_stale_baselines() {
        let store = SessionStore::new();
        store.begin_sync("s1");
        store.install_baseline("s1", baseline_with(&["a"]), 10);

        store.begin_sync("s1");
        store.handle_update("s1", appended("b", ""), 11);
        assert_eq!(ids(&store), vec!["a", "b"], "resync shows live changes");

        store.install_baseline("s1", baseline_with(&["a"]), 12);
        assert_eq!(ids(&store), vec!["a"]);

        store.handle_update("s1", appended("late", ""), 5);
        store.install_baseline("s1", baseline_with(&[]), 6);
        assert_eq!(ids(&store), vec!["a"]);
    }

    #[test]
    fn aborted_first_sync_applies_buffered_updates() {
        let store = SessionStore::new();
        store.begin_sync("s1");
        store.handle_update("s1", appended("a", ""), 1);
        store.abort_sync("s1");
        assert_eq!(ids(&store), vec!["a"]);
        assert!(!store.snapshot("s1").expect("snapshot").synced);
    }

    #[tokio::test]
    async fn optimistic_lifecycle_is_broadcast() {
        let store = SessionStore::new();
        let mut events = store.events("s1");

        let message_id = store.add_optimistic_message("s1", "hello");
        let event = events.recv().await.expect("event");
        assert_eq!(
            event.change,
            SessionChange::ItemAppended {
                item_id: message_id.clone()
            }
        );

        assert!(store.mark_failed("s1", &message_id));
        let event = events.recv().await.expect("event");
        assert_eq!(
            event.change,
            SessionChange::ItemFailed {
                item_id: message_id.clone()
            }
        );
        let snapshot = store.snapshot("s1").expect("snapshot");
        assert_eq!(
            snapshot.entry(&message_id).expect("entry").origin,
            EntryOrigin::Failed
        );
        assert!(!store.mark_failed("unknown", &message_id));
    }
}
