//! `watch` and `prompt`: follow a subscribed session as it changes.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use aerolink_client::{
    ChatEntry, Client, ConnectionState, EntryOrigin, PermissionRequest, SessionChange,
    SessionEvent, SessionSnapshot,
};
use aerolink_protocol::{PermissionOption, PermissionOutcome};
use anyhow::Context;
use console::style;
use serde_json::json;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

use crate::output::{self, Output};

/// Prints chat entries as they change. Re-showing an entry is a no-op unless
/// its rendering changed; a pure text append to the last printed entry is
/// written inline, so streamed replies read naturally.
struct TranscriptPrinter<W: Write> {
    out: W,
    json: bool,
    shown: HashMap<String, String>,
    /// Entry whose text ends the output, with no newline yet.
    tail: Option<String>,
}

impl<W: Write> TranscriptPrinter<W> {
    fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            shown: HashMap::new(),
            tail: None,
        }
    }

    fn render(&self, entry: &ChatEntry) -> anyhow::Result<String> {
        // Optimistic entries print like confirmed ones; only failure is news.
        let origin = match entry.origin {
            EntryOrigin::Failed => EntryOrigin::Failed,
            EntryOrigin::Optimistic | EntryOrigin::Confirmed => EntryOrigin::Confirmed,
        };
        if self.json {
            return Ok(json!({
                "item": entry.item,
                "failed": origin == EntryOrigin::Failed,
            })
            .to_string());
        }
        Ok(output::render_item(&entry.item, origin))
    }

    /// Treat everything in `snapshot` as already on screen.
    fn mark_seen(&mut self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        for entry in &snapshot.entries {
            let text = self.render(entry)?;
            self.shown.insert(entry.id().to_string(), text);
        }
        Ok(())
    }

    fn show_all(&mut self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        for entry in &snapshot.entries {
            self.show_entry(entry)?;
        }
        Ok(())
    }

    fn show_entry(&mut self, entry: &ChatEntry) -> anyhow::Result<()> {
        let text = self.render(entry)?;
        let append_from = match self.shown.get(entry.id()) {
            Some(previous) if *previous == text => return Ok(()),
            Some(previous)
                if !self.json
                    && self.tail.as_deref() == Some(entry.id())
                    && text.starts_with(previous.as_str()) =>
            {
                Some(previous.len())
            }
            _ => None,
        };

        match append_from {
            Some(at) => write!(self.out, "{}", &text[at..])?,
            None => {
                self.end_line()?;
                write!(self.out, "{text}")?;
            }
        }
        self.tail = Some(entry.id().to_string());
        self.shown.insert(entry.id().to_string(), text);
        if self.json {
            self.end_line()?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn on_event(&mut self, event: &SessionEvent, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        match &event.change {
            SessionChange::ItemAppended { item_id }
            | SessionChange::ItemConfirmed { item_id }
            | SessionChange::ItemUpdated { item_id }
            | SessionChange::ItemFailed { item_id } => match snapshot.entry(item_id) {
                Some(entry) => self.show_entry(entry),
                None => Ok(()),
            },
            SessionChange::Baseline | SessionChange::Reset if !self.json => {
                self.show_all(snapshot)?;
                self.describe(event, snapshot)
            }
            _ => self.describe(event, snapshot),
        }
    }

    fn describe(&mut self, event: &SessionEvent, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        if self.json {
            let line = json!({
                "change": change_name(&event.change),
                "revision": event.revision,
                "model_id": snapshot.current_model_id(),
                "mode_id": snapshot.current_mode_id(),
                "dangerous_mode": snapshot.dangerous_mode,
                "prompt_in_flight": snapshot.prompt_in_flight,
            });
            return self.line(&line.to_string());
        }
        match output::describe_change(event, snapshot) {
            Some(line) => self.line(&line),
            None => Ok(()),
        }
    }

    fn note(&mut self, text: &str) -> anyhow::Result<()> {
        if self.json {
            return Ok(());
        }
        self.line(&format!("{}", style(format!("-- {text}")).dim()))
    }

    fn line(&mut self, text: &str) -> anyhow::Result<()> {
        self.end_line()?;
        writeln!(self.out, "{text}")?;
        self.out.flush()?;
        Ok(())
    }

    fn end_line(&mut self) -> std::io::Result<()> {
        if self.tail.take().is_some() {
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.end_line()?;
        self.out.flush()?;
        Ok(())
    }
}

fn change_name(change: &SessionChange) -> &'static str {
    match change {
        SessionChange::Baseline => "baseline",
        SessionChange::Reset => "reset",
        SessionChange::ItemAppended { .. } => "item_appended",
        SessionChange::ItemConfirmed { .. } => "item_confirmed",
        SessionChange::ItemUpdated { .. } => "item_updated",
        SessionChange::ItemFailed { .. } => "item_failed",
        SessionChange::ModelChanged => "model_changed",
        SessionChange::ModeChanged => "mode_changed",
        SessionChange::DangerousModeChanged { .. } => "dangerous_mode_changed",
        SessionChange::PromptStateChanged { .. } => "prompt_state_changed",
    }
}

fn current(client: &Client, session_id: &str) -> Arc<SessionSnapshot> {
    client
        .session(session_id)
        .unwrap_or_else(|| Arc::new(SessionSnapshot::new(session_id)))
}

fn connection_note(state: ConnectionState, last_error: Option<&str>) -> Option<String> {
    match state {
        ConnectionState::Error => Some(format!(
            "connection lost ({}), reconnecting",
            last_error.unwrap_or("unknown error")
        )),
        ConnectionState::Connected => Some("connected".to_string()),
        ConnectionState::Connecting | ConnectionState::Disconnected => None,
    }
}

pub async fn watch(client: &Client, session_id: &str, output: Output) -> anyhow::Result<()> {
    let mut events = client.watch_session(session_id);
    client
        .subscribe_session(session_id)
        .await
        .with_context(|| format!("could not subscribe to {session_id}"))?;

    let mut printer = TranscriptPrinter::new(std::io::stdout(), output.is_json());
    printer.show_all(&current(client, session_id))?;
    if !output.is_json() {
        eprintln!(
            "{}",
            style(format!("watching {session_id}, Ctrl-C to stop")).dim()
        );
    }

    let mut status = client.watch_status();
    let mut status_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => printer.on_event(&event, &current(client, session_id))?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "cli",
                        event = "cli.watch.lagged",
                        session_id = %session_id,
                        skipped,
                        "Watcher fell behind; re-rendering from snapshot"
                    );
                    printer.show_all(&current(client, session_id))?;
                }
                Err(RecvError::Closed) => break,
            },
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                } else {
                    let status = status.borrow_and_update().clone();
                    if let Some(note) = connection_note(status.state, status.last_error.as_deref()) {
                        printer.note(&note)?;
                    }
                }
            }
        }
    }

    printer.finish()?;
    client
        .unsubscribe_session(session_id)
        .await
        .with_context(|| format!("could not unsubscribe from {session_id}"))?;
    Ok(())
}

pub async fn prompt(
    client: &Client,
    session_id: &str,
    text: &str,
    auto_approve: bool,
    output: Output,
) -> anyhow::Result<()> {
    let mut events = client.watch_session(session_id);
    client
        .subscribe_session(session_id)
        .await
        .with_context(|| format!("could not subscribe to {session_id}"))?;

    let mut printer = TranscriptPrinter::new(std::io::stdout(), output.is_json());
    printer.mark_seen(&current(client, session_id))?;

    let mut permissions = client.watch_permissions();
    let mut permissions_open = true;
    let mut events_open = true;
    let mut answered_ticket: Option<u64> = None;
    let mut interrupted = false;

    let turn = client.prompt(session_id, text);
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            result = &mut turn => break result,
            event = events.recv(), if events_open => match event {
                Ok(event) => printer.on_event(&event, &current(client, session_id))?,
                Err(RecvError::Lagged(_)) => printer.show_all(&current(client, session_id))?,
                Err(RecvError::Closed) => events_open = false,
            },
            changed = permissions.changed(), if permissions_open => {
                if changed.is_err() {
                    permissions_open = false;
                } else {
                    let request = permissions
                        .borrow_and_update()
                        .iter()
                        .find(|request| request.session_id == session_id)
                        .cloned();
                    if let Some(request) = request.filter(|r| answered_ticket != Some(r.ticket)) {
                        answered_ticket = Some(request.ticket);
                        printer.finish()?;
                        let decision = decide(&request, auto_approve).await?;
                        if let Err(e) = client.respond_permission(session_id, decision) {
                            printer.note(&format!("permission no longer pending: {e}"))?;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    anyhow::bail!("interrupted");
                }
                interrupted = true;
                printer.note("cancelling turn (Ctrl-C again to quit)")?;
                if let Err(e) = client.cancel_session(session_id).await {
                    warn!(
                        component = "cli",
                        event = "cli.prompt.cancel_failed",
                        session_id = %session_id,
                        error = %e,
                        "cancel_session failed"
                    );
                }
            }
        }
    };

    // Updates that raced the prompt response.
    loop {
        match events.try_recv() {
            Ok(event) => printer.on_event(&event, &current(client, session_id))?,
            Err(TryRecvError::Lagged(_)) => printer.show_all(&current(client, session_id))?,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    printer.finish()?;

    if let Err(e) = client.unsubscribe_session(session_id).await {
        warn!(
            component = "cli",
            event = "cli.prompt.unsubscribe_failed",
            session_id = %session_id,
            error = %e,
            "unsubscribe after prompt failed"
        );
    }

    let response = outcome.with_context(|| format!("prompt to {session_id} failed"))?;
    let stop_reason = serde_json::to_value(response.stop_reason)?;
    info!(
        component = "cli",
        event = "cli.prompt.finished",
        session_id = %session_id,
        stop_reason = %stop_reason,
        "Prompt finished"
    );
    if output.is_json() {
        return output.print_json(&json!({
            "session_id": session_id,
            "stop_reason": stop_reason,
        }));
    }
    printer.note(&format!(
        "turn finished: {}",
        stop_reason.as_str().unwrap_or_default()
    ))
}

async fn decide(request: &PermissionRequest, auto_approve: bool) -> anyhow::Result<PermissionOutcome> {
    if auto_approve {
        let outcome = auto_decision(&request.options);
        let label = match &outcome {
            PermissionOutcome::Selected { option_id } => format!("auto-selected {option_id}"),
            PermissionOutcome::Cancelled => "no allow option offered, cancelled".to_string(),
        };
        eprintln!(
            "{} {} ({label})",
            style("Permission:").yellow().bold(),
            request.tool_call.title
        );
        return Ok(outcome);
    }

    eprintln!(
        "{}",
        output::permission_prompt(&request.tool_call.title, &request.options)
    );
    loop {
        eprint!("choice> ");
        let line = tokio::task::spawn_blocking(|| console::Term::stderr().read_line()).await??;
        match parse_choice(&line, &request.options) {
            Some(outcome) => return Ok(outcome),
            None => eprintln!("enter 1-{} or c", request.options.len()),
        }
    }
}

fn auto_decision(options: &[PermissionOption]) -> PermissionOutcome {
    options
        .iter()
        .find(|option| option.kind.is_allow())
        .map(|option| PermissionOutcome::Selected {
            option_id: option.option_id.clone(),
        })
        .unwrap_or(PermissionOutcome::Cancelled)
}

/// `1..=n` picks an option; `c` or an empty line (EOF included) cancels.
fn parse_choice(input: &str, options: &[PermissionOption]) -> Option<PermissionOutcome> {
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("c") {
        return Some(PermissionOutcome::Cancelled);
    }
    let index: usize = input.parse().ok()?;
    let option = options.get(index.checked_sub(1)?)?;
    Some(PermissionOutcome::Selected {
        option_id: option.option_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerolink_client::session_state::apply_update;
    use aerolink_protocol::{
        ChatItem, ItemPatch, Message, MessageRole, PermissionOptionKind, SessionUpdate, ToolCall,
        ToolCallStatus,
    };

    fn options() -> Vec<PermissionOption> {
        vec![
            PermissionOption {
                option_id: "reject".into(),
                name: "Reject".into(),
                kind: PermissionOptionKind::RejectOnce,
            },
            PermissionOption {
                option_id: "allow".into(),
                name: "Allow once".into(),
                kind: PermissionOptionKind::AllowOnce,
            },
        ]
    }

    fn apply(
        printer: &mut TranscriptPrinter<Vec<u8>>,
        snapshot: &mut SessionSnapshot,
        update: SessionUpdate,
    ) {
        let change = apply_update(snapshot, update).expect("change");
        let event = SessionEvent {
            session_id: snapshot.session_id.clone(),
            revision: snapshot.revision,
            change,
        };
        printer.on_event(&event, snapshot).expect("print");
    }

    fn text(printer: TranscriptPrinter<Vec<u8>>) -> String {
        String::from_utf8(printer.out).expect("utf8")
    }

    #[test]
    fn streamed_text_is_appended_inline() {
        console::set_colors_enabled(false);
        let mut snapshot = SessionSnapshot::new("s1");
        let mut printer = TranscriptPrinter::new(Vec::new(), false);

        apply(
            &mut printer,
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: ChatItem::Message(Message {
                    id: "m1".into(),
                    role: MessageRole::Assistant,
                    content: "Hel".into(),
                    timestamp: 0,
                }),
            },
        );
        apply(
            &mut printer,
            &mut snapshot,
            SessionUpdate::ItemUpdated {
                item_id: "m1".into(),
                patch: ItemPatch {
                    append_text: Some("lo".into()),
                    ..ItemPatch::default()
                },
            },
        );
        apply(
            &mut printer,
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: ChatItem::ToolCall(ToolCall {
                    id: "t1".into(),
                    title: "cargo build".into(),
                    kind: None,
                    status: ToolCallStatus::InProgress,
                    raw_input: None,
                    output: None,
                }),
            },
        );
        apply(
            &mut printer,
            &mut snapshot,
            SessionUpdate::PromptStateChanged { in_flight: false },
        );
        printer.finish().expect("finish");

        assert_eq!(
            text(printer),
            "agent: Hello\n⚙ cargo build [running]\n-- agent idle\n"
        );
    }

    #[test]
    fn showing_the_same_snapshot_twice_prints_once() {
        console::set_colors_enabled(false);
        let mut snapshot = SessionSnapshot::new("s1");
        apply_update(
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: ChatItem::Message(Message {
                    id: "m1".into(),
                    role: MessageRole::User,
                    content: "hi".into(),
                    timestamp: 0,
                }),
            },
        );
        let mut printer = TranscriptPrinter::new(Vec::new(), false);
        printer.show_all(&snapshot).expect("show");
        printer.show_all(&snapshot).expect("show");
        printer.finish().expect("finish");
        assert_eq!(text(printer), "you: hi\n");
    }

    #[test]
    fn json_mode_prints_one_line_per_item() {
        let mut snapshot = SessionSnapshot::new("s1");
        let mut printer = TranscriptPrinter::new(Vec::new(), true);
        apply(
            &mut printer,
            &mut snapshot,
            SessionUpdate::ItemAppended {
                item: ChatItem::Message(Message {
                    id: "m1".into(),
                    role: MessageRole::Assistant,
                    content: "ok".into(),
                    timestamp: 0,
                }),
            },
        );
        printer.finish().expect("finish");

        let output = text(printer);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(value["item"]["id"], "m1");
        assert_eq!(value["failed"], false);
    }

    #[test]
    fn auto_approve_picks_first_allow_option() {
        assert_eq!(
            auto_decision(&options()),
            PermissionOutcome::Selected {
                option_id: "allow".into()
            }
        );
        assert_eq!(auto_decision(&options()[..1]), PermissionOutcome::Cancelled);
    }

    #[test]
    fn parses_interactive_choices() {
        let options = options();
        assert_eq!(
            parse_choice("2\n", &options),
            Some(PermissionOutcome::Selected {
                option_id: "allow".into()
            })
        );
        assert_eq!(parse_choice("c", &options), Some(PermissionOutcome::Cancelled));
        assert_eq!(parse_choice("", &options), Some(PermissionOutcome::Cancelled));
        assert_eq!(parse_choice("0", &options), None);
        assert_eq!(parse_choice("3", &options), None);
        assert_eq!(parse_choice("yes", &options), None);
    }

    #[test]
    fn connection_notes_only_for_visible_transitions() {
        assert!(connection_note(ConnectionState::Error, Some("eof"))
            .expect("note")
            .contains("eof"));
        assert!(connection_note(ConnectionState::Connecting, None).is_none());
    }
}
