use aerolink_client::{Client, EntryOrigin, SessionSnapshot};
use aerolink_protocol::{ListSessionsParams, NewSessionResponse};
use anyhow::Context;
use console::style;
use serde_json::json;

use crate::output::{self, Output};
use crate::SessionCommand;

pub async fn run(client: &Client, command: SessionCommand, output: Output) -> anyhow::Result<()> {
    match command {
        SessionCommand::List { cwd, limit, offset } => {
            let page = client
                .list_sessions(ListSessionsParams { cwd, limit, offset })
                .await
                .context("list_sessions failed")?;
            if output.is_json() {
                return output.print_json(&page);
            }
            if page.sessions.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            println!("{}", output::sessions_table(&page.sessions));
            let shown_to = offset + page.sessions.len();
            let mut footer = format!("{}-{} of {}", offset + 1, shown_to, page.total);
            if page.has_more {
                footer.push_str(&format!(" (next: --offset {shown_to})"));
            }
            println!("{}", style(footer).dim());
            Ok(())
        }
        SessionCommand::Info { session_id } => {
            let info = client
                .get_session_info(&session_id)
                .await
                .with_context(|| format!("get_session_info {session_id} failed"))?;
            if output.is_json() {
                return output.print_json(&info);
            }
            println!("{}", output::session_details(&info));
            Ok(())
        }
        SessionCommand::State { session_id } => {
            let state = client
                .get_session_state(&session_id)
                .await
                .with_context(|| format!("get_session_state {session_id} failed"))?;
            if output.is_json() {
                return output.print_json(&state);
            }
            for item in &state.chat_items {
                println!("{}", output::render_item(item, EntryOrigin::Confirmed));
            }
            Ok(())
        }
        SessionCommand::Create { cwd } => {
            let created = client
                .create_session(&cwd)
                .await
                .context("create_session failed")?;
            print_opened(client, "Created", &created, output)
        }
        SessionCommand::Resume { session_id, cwd } => {
            let resumed = client
                .resume_session(&session_id, &cwd)
                .await
                .with_context(|| format!("resume_session {session_id} failed"))?;
            print_opened(client, "Resumed", &resumed, output)
        }
        SessionCommand::Fork { session_id, cwd } => {
            let forked = client
                .fork_session(&session_id, &cwd)
                .await
                .with_context(|| format!("fork_session {session_id} failed"))?;
            print_opened(client, "Forked into", &forked, output)
        }
    }
}

fn print_opened(
    client: &Client,
    verb: &str,
    response: &NewSessionResponse,
    output: Output,
) -> anyhow::Result<()> {
    if output.is_json() {
        return output.print_json(response);
    }
    println!("{} {} {}", style("✓").green().bold(), verb, response.session_id);
    if let Some(snapshot) = client.session(&response.session_id) {
        print_settings(&snapshot);
    }
    Ok(())
}

fn print_settings(snapshot: &SessionSnapshot) {
    if let Some(models) = &snapshot.models {
        let names: Vec<&str> = models
            .available_models
            .iter()
            .map(|model| model.model_id.as_str())
            .collect();
        println!(
            "  Model: {} (available: {})",
            models.current_model_id,
            names.join(", ")
        );
    }
    if let Some(modes) = &snapshot.modes {
        let names: Vec<&str> = modes.available_modes.iter().map(|mode| mode.id.as_str()).collect();
        println!(
            "  Mode:  {} (available: {})",
            modes.current_mode_id,
            names.join(", ")
        );
    }
}

pub async fn cancel(client: &Client, session_id: &str, output: Output) -> anyhow::Result<()> {
    client
        .cancel_session(session_id)
        .await
        .with_context(|| format!("cancel_session {session_id} failed"))?;
    output.done(
        &format!("Cancelled the running turn of {session_id}"),
        json!({"session_id": session_id, "cancelled": true}),
    )
}

pub async fn set_model(
    client: &Client,
    session_id: &str,
    model_id: &str,
    output: Output,
) -> anyhow::Result<()> {
    client
        .set_session_model(session_id, model_id)
        .await
        .with_context(|| format!("set_session_model {session_id} failed"))?;
    output.done(
        &format!("{session_id} now uses model {model_id}"),
        json!({"session_id": session_id, "model_id": model_id}),
    )
}

pub async fn set_mode(
    client: &Client,
    session_id: &str,
    mode_id: &str,
    output: Output,
) -> anyhow::Result<()> {
    client
        .set_session_mode(session_id, mode_id)
        .await
        .with_context(|| format!("set_session_mode {session_id} failed"))?;
    output.done(
        &format!("{session_id} switched to mode {mode_id}"),
        json!({"session_id": session_id, "mode_id": mode_id}),
    )
}
