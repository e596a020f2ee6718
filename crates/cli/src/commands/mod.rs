mod files;
mod live;
mod sessions;
mod terminals;

use aerolink_client::Client;

use crate::output::Output;
use crate::Command;

pub async fn run(client: &Client, command: Command, output: Output) -> anyhow::Result<()> {
    match command {
        Command::Sessions { command } => sessions::run(client, command, output).await,
        Command::Watch { session_id } => live::watch(client, &session_id, output).await,
        Command::Prompt {
            session_id,
            text,
            auto_approve,
        } => live::prompt(client, &session_id, &text, auto_approve, output).await,
        Command::Cancel { session_id } => sessions::cancel(client, &session_id, output).await,
        Command::Model {
            session_id,
            model_id,
        } => sessions::set_model(client, &session_id, &model_id, output).await,
        Command::Mode {
            session_id,
            mode_id,
        } => sessions::set_mode(client, &session_id, &mode_id, output).await,
        Command::Files { command } => files::run(client, command, output).await,
        Command::Terminals { command } => terminals::run(client, command, output).await,
        // Handled before connecting.
        Command::Completions { .. } => Ok(()),
    }
}
