use aerolink_client::Client;
use anyhow::Context;
use serde_json::json;

use crate::output::{self, Output};
use crate::TerminalCommand;

pub async fn run(client: &Client, command: TerminalCommand, output: Output) -> anyhow::Result<()> {
    let terminals = client.terminals();
    match command {
        TerminalCommand::List => {
            let list = terminals
                .list_terminals()
                .await
                .context("list_terminals failed")?;
            if output.is_json() {
                return output.print_json(&list);
            }
            if list.is_empty() {
                println!("No terminals.");
                return Ok(());
            }
            println!("{}", output::terminals_table(&list));
            Ok(())
        }
        TerminalCommand::Kill { terminal_id } => {
            terminals
                .kill_terminal(&terminal_id)
                .await
                .with_context(|| format!("kill_terminal {terminal_id} failed"))?;
            output.done(
                &format!("Killed terminal {terminal_id}"),
                json!({"terminal_id": terminal_id}),
            )
        }
    }
}
