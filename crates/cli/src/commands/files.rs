use aerolink_client::Client;
use anyhow::Context;
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::output::{self, Output};
use crate::FileCommand;

pub async fn run(client: &Client, command: FileCommand, output: Output) -> anyhow::Result<()> {
    let files = client.files();
    match command {
        FileCommand::Ls { path } => {
            let entries = files
                .list_directory(&path)
                .await
                .with_context(|| format!("list_directory {path} failed"))?;
            if output.is_json() {
                return output.print_json(&entries);
            }
            if entries.is_empty() {
                println!("{path} is empty.");
                return Ok(());
            }
            println!("{}", output::directory_table(&entries));
            Ok(())
        }
        FileCommand::Cat { path } => {
            let content = files
                .read_file(&path)
                .await
                .with_context(|| format!("read_file {path} failed"))?;
            if output.is_json() {
                return output.print_json(&json!({"path": path, "content": content}));
            }
            print!("{content}");
            if !content.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        FileCommand::Write { path, content } => {
            let content = match content {
                Some(content) => content,
                None => read_stdin().await?,
            };
            files
                .write_file(&path, &content)
                .await
                .with_context(|| format!("write_file {path} failed"))?;
            output.done(
                &format!("Wrote {} bytes to {path}", content.len()),
                json!({"path": path, "bytes": content.len()}),
            )
        }
        FileCommand::Touch { path, content } => {
            files
                .create_file(&path, content.as_deref())
                .await
                .with_context(|| format!("create_file {path} failed"))?;
            output.done(&format!("Created {path}"), json!({"path": path}))
        }
        FileCommand::Mkdir { path } => {
            files
                .create_directory(&path)
                .await
                .with_context(|| format!("create_directory {path} failed"))?;
            output.done(&format!("Created directory {path}"), json!({"path": path}))
        }
        FileCommand::Rm { path } => {
            files
                .delete_path(&path)
                .await
                .with_context(|| format!("delete_path {path} failed"))?;
            output.done(&format!("Deleted {path}"), json!({"path": path}))
        }
        FileCommand::Mv { from, to } => {
            files
                .rename_path(&from, &to)
                .await
                .with_context(|| format!("rename_path {from} failed"))?;
            output.done(
                &format!("Moved {from} to {to}"),
                json!({"from": from, "to": to}),
            )
        }
    }
}

async fn read_stdin() -> anyhow::Result<String> {
    let mut content = String::new();
    tokio::io::stdin()
        .read_to_string(&mut content)
        .await
        .context("failed to read content from stdin")?;
    Ok(content)
}
