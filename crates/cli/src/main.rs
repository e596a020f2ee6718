//! Aerolink CLI
//!
//! Drive remote agent sessions from the terminal: list and open sessions,
//! watch them live, send prompts and answer permission requests, and relay
//! file and terminal calls to the server.

mod commands;
mod config;
mod logging;
mod output;
mod paths;

use std::path::PathBuf;
use std::process::ExitCode;

use aerolink_client::Client;
use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use tracing::{info, warn};

use crate::config::FlagOverrides;
use crate::output::Output;
use crate::paths::DataDir;

#[derive(Debug, Parser)]
#[command(
    name = "aerolink",
    version,
    about = "Drive remote agent sessions from the terminal"
)]
struct Cli {
    /// Server WebSocket URL
    #[arg(long, global = true, env = "AEROLINK_URL")]
    url: Option<String>,

    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Data directory for config and logs (default: ~/.aerolink)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List, inspect, and open sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Follow a session live until Ctrl-C
    Watch {
        session_id: String,
    },

    /// Send a prompt and stream the turn
    Prompt {
        session_id: String,
        text: String,
        /// Answer permission requests with the first allow option
        #[arg(long)]
        auto_approve: bool,
    },

    /// Cancel the running turn
    Cancel {
        session_id: String,
    },

    /// Switch a session's model
    Model {
        session_id: String,
        model_id: String,
    },

    /// Switch a session's mode
    Mode {
        session_id: String,
        mode_id: String,
    },

    /// Relay file operations to the server
    Files {
        #[command(subcommand)]
        command: FileCommand,
    },

    /// Manage server-side terminals
    Terminals {
        #[command(subcommand)]
        command: TerminalCommand,
    },

    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// List sessions, most recent first
    List {
        /// Only sessions in this working directory
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one session's summary
    Info {
        session_id: String,
    },
    /// Print a session's full transcript
    State {
        session_id: String,
    },
    /// Start a new session in a working directory
    Create {
        cwd: String,
    },
    /// Reopen a historical session
    Resume {
        session_id: String,
        cwd: String,
    },
    /// Branch a session into a new one
    Fork {
        session_id: String,
        cwd: String,
    },
}

#[derive(Debug, Subcommand)]
enum FileCommand {
    /// List a directory
    Ls {
        path: String,
    },
    /// Print a file
    Cat {
        path: String,
    },
    /// Overwrite a file with --content, or stdin when omitted
    Write {
        path: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// Create a file, failing if it exists
    Touch {
        path: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// Create a directory
    Mkdir {
        path: String,
    },
    /// Delete a file or directory
    Rm {
        path: String,
    },
    /// Rename or move a path
    Mv {
        from: String,
        to: String,
    },
}

#[derive(Debug, Subcommand)]
enum TerminalCommand {
    /// List terminals
    List,
    /// Kill a terminal
    Kill {
        terminal_id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "aerolink", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{} failed to start runtime: {err}", style("error:").red().bold());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let _logging = match data_dir
        .ensure_dirs()
        .map_err(anyhow::Error::from)
        .and_then(|()| logging::init_logging(&data_dir.log_dir()))
    {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!(
                "{} file logging disabled: {err:#}",
                style("warning:").yellow().bold()
            );
            None
        }
    };

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (data_dir.config_path(), false),
    };
    let config = config::resolve(
        &config_path,
        required,
        |key| std::env::var(key).ok(),
        &FlagOverrides {
            url: cli.url.clone(),
            request_timeout_ms: cli.timeout_ms,
        },
    )?;

    let client = Client::new(config).context("failed to build client")?;
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", client.config().url))?;
    info!(
        component = "cli",
        event = "cli.connected",
        url = %client.config().url,
        "Connected"
    );

    let output = Output::new(cli.json);
    let result = commands::run(&client, cli.command, output).await;
    if let Err(err) = &result {
        warn!(
            component = "cli",
            event = "cli.command.failed",
            error = %format!("{err:#}"),
            "Command failed"
        );
    }
    client.disconnect().await;
    result
}
