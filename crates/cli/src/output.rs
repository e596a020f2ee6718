//! Terminal rendering: tables for listings, styled lines for live chat, and a
//! `--json` mode that prints the raw payloads instead.

use aerolink_client::{EntryOrigin, SessionEvent, SessionChange, SessionSnapshot};
use aerolink_protocol::{
    ChatItem, FileEntry, MessageRole, PermissionOption, SessionInfo, TerminalInfo, ToolCallStatus,
};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::style;
use serde::Serialize;

const SUMMARY_WIDTH: usize = 48;

#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Confirmation for commands with no payload of their own.
    pub fn done(&self, message: &str, value: serde_json::Value) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&value);
        }
        println!("{} {}", style("✓").green().bold(), message);
        Ok(())
    }
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .iter()
                .map(|title| Cell::new(title).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    table
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let mut cut: String = single_line.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

pub fn sessions_table(sessions: &[SessionInfo]) -> Table {
    let mut table = table(&["ID", "ACTIVE", "MESSAGES", "LAST ACTIVITY", "CWD", "SUMMARY"]);
    for session in sessions {
        let active = if session.active {
            Cell::new("●").fg(Color::Green)
        } else {
            Cell::new("○").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&session.id),
            active,
            Cell::new(session.message_count),
            Cell::new(&session.last_activity),
            Cell::new(&session.cwd),
            Cell::new(truncate(&session.summary, SUMMARY_WIDTH)),
        ]);
    }
    table
}

pub fn session_details(session: &SessionInfo) -> String {
    let mut lines = vec![
        format!("{} {}", style("Session").bold(), session.id),
        format!("  Summary:        {}", session.summary),
        format!("  Working dir:    {}", session.cwd),
        format!("  Messages:       {}", session.message_count),
        format!("  Last activity:  {}", session.last_activity),
        format!("  Active:         {}", if session.active { "yes" } else { "no" }),
    ];
    if let Some(project) = &session.project {
        lines.push(format!("  Project:        {project}"));
    }
    if let Some(message) = &session.last_user_message {
        lines.push(format!("  Last prompt:    {}", truncate(message, 72)));
    }
    if let Some(message) = &session.last_assistant_message {
        lines.push(format!("  Last reply:     {}", truncate(message, 72)));
    }
    lines.join("\n")
}

pub fn directory_table(entries: &[FileEntry]) -> Table {
    let mut table = table(&["NAME", "TYPE", "SIZE"]);
    for entry in entries {
        let (name, kind) = if entry.is_dir {
            (Cell::new(format!("{}/", entry.name)).fg(Color::Blue), "dir")
        } else {
            (Cell::new(&entry.name), "file")
        };
        let size = entry
            .size
            .filter(|_| !entry.is_dir)
            .map(|size| size.to_string())
            .unwrap_or_default();
        table.add_row(vec![name, Cell::new(kind), Cell::new(size)]);
    }
    table
}

pub fn terminals_table(terminals: &[TerminalInfo]) -> Table {
    let mut table = table(&["ID", "SIZE", "ALIVE", "CWD"]);
    for terminal in terminals {
        table.add_row(vec![
            Cell::new(&terminal.terminal_id),
            Cell::new(format!("{}x{}", terminal.cols, terminal.rows)),
            Cell::new(if terminal.alive { "yes" } else { "no" }),
            Cell::new(terminal.cwd.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

/// One chat item as a single styled block.
pub fn render_item(item: &ChatItem, origin: EntryOrigin) -> String {
    let marker = match origin {
        EntryOrigin::Confirmed => String::new(),
        EntryOrigin::Optimistic => format!(" {}", style("(sending)").dim()),
        EntryOrigin::Failed => format!(" {}", style("(failed)").red()),
    };
    match item {
        ChatItem::Message(message) => {
            let who = match message.role {
                MessageRole::User => style("you").green().bold(),
                MessageRole::Assistant => style("agent").magenta().bold(),
                MessageRole::System => style("system").yellow().bold(),
            };
            format!("{who}{marker}: {}", message.content)
        }
        ChatItem::ToolCall(call) => {
            let status = match call.status {
                ToolCallStatus::Pending => style("pending").dim(),
                ToolCallStatus::InProgress => style("running").yellow(),
                ToolCallStatus::Completed => style("done").green(),
                ToolCallStatus::Failed => style("failed").red(),
            };
            let mut line = format!("{} {} [{status}]{marker}", style("⚙").cyan(), call.title);
            if let Some(output) = call.output.as_deref().filter(|output| !output.is_empty()) {
                line.push_str(&format!("\n    {}", truncate(output, 120)));
            }
            line
        }
        ChatItem::Thought(thought) => {
            format!("{}", style(format!("… {}", thought.content)).dim().italic())
        }
    }
}

/// Human line for a live change; `None` when the change needs no line of its
/// own (item changes are rendered from the snapshot by the caller).
pub fn describe_change(event: &SessionEvent, snapshot: &SessionSnapshot) -> Option<String> {
    let note = |text: String| Some(format!("{}", style(format!("-- {text}")).dim()));
    match &event.change {
        SessionChange::Baseline | SessionChange::Reset => {
            note(format!("synced ({} items)", snapshot.entries.len()))
        }
        SessionChange::ModelChanged => {
            note(format!("model: {}", snapshot.current_model_id().unwrap_or("-")))
        }
        SessionChange::ModeChanged => {
            note(format!("mode: {}", snapshot.current_mode_id().unwrap_or("-")))
        }
        SessionChange::DangerousModeChanged { enabled } => {
            note(format!("dangerous mode {}", if *enabled { "on" } else { "off" }))
        }
        SessionChange::PromptStateChanged { in_flight } => {
            note(if *in_flight { "agent working".into() } else { "agent idle".into() })
        }
        SessionChange::ItemAppended { .. }
        | SessionChange::ItemConfirmed { .. }
        | SessionChange::ItemUpdated { .. }
        | SessionChange::ItemFailed { .. } => None,
    }
}

pub fn permission_prompt(title: &str, options: &[PermissionOption]) -> String {
    let mut lines = vec![format!(
        "{} {}",
        style("Permission requested:").yellow().bold(),
        title
    )];
    for (index, option) in options.iter().enumerate() {
        lines.push(format!("  [{}] {}", index + 1, option.name));
    }
    lines.push("  [c] cancel".to_string());
    lines.join("\n")
}
