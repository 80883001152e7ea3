use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use foundry::config::FoundryConfig;
use foundry::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version, about = "Checkpointed drafting workflow with a human review gate")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and event stream
    Serve {
        /// Port to serve on (overrides foundry.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Drafting rounds before forcing review
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Serve drafting tools to an MCP client over stdio
    Mcp {
        /// Drafting rounds before forcing review
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Draft a piece of text in the foreground, reviewing it on the terminal
    Run {
        /// What the draft should accomplish
        intent: String,

        /// Drafting rounds before forcing review
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Approve every draft that reaches review
        #[arg(long, conflicts_with = "detach")]
        yes: bool,

        /// Stop at the first review and leave it for `foundry review`
        #[arg(long)]
        detach: bool,
    },
    /// Review a paused thread, or restart one that stopped mid-flight
    Review {
        thread: String,

        /// approve, reject or cancel; prompts when omitted
        #[arg(long)]
        action: Option<String>,

        /// Feedback for the next drafting round
        #[arg(long)]
        feedback: Option<String>,

        /// File holding an edited draft
        #[arg(long)]
        edits: Option<PathBuf>,
    },
    /// Show the latest state of a thread
    State {
        thread: String,

        #[arg(long)]
        json: bool,
    },
    /// List a thread's checkpoints
    History {
        thread: String,

        #[arg(long)]
        json: bool,
    },
    /// Rebuild a thread from its checkpoints and check it against the head
    Replay { thread: String },
    /// List sessions
    Sessions {
        /// Only sessions with this status
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Delete a thread and its session
    Delete { thread: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Check foundry.toml for problems
    Validate,
    /// Write a default foundry.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // A broken foundry.toml is reported by the command itself.
    let log_dir = FoundryConfig::new(project_dir.clone())
        .ok()
        .and_then(|config| config.log_dir());
    let filter = if cli.verbose {
        "foundry=debug,tower_http=debug"
    } else {
        logging::DEFAULT_FILTER
    };
    let _log_guard = logging::init(log_dir.as_deref(), filter)?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            max_iterations,
        } => {
            cmd::cmd_serve(&project_dir, host.as_deref(), *port, *max_iterations).await?;
        }
        Commands::Mcp { max_iterations } => cmd::cmd_mcp(&project_dir, *max_iterations).await?,
        Commands::Run {
            intent,
            max_iterations,
            yes,
            detach,
        } => {
            let mode = if *yes {
                cmd::ReviewMode::AutoApprove
            } else if *detach {
                cmd::ReviewMode::StopAtPause
            } else {
                cmd::ReviewMode::Prompt
            };
            cmd::cmd_run(&project_dir, intent, *max_iterations, mode, cli.verbose).await?;
        }
        Commands::Review {
            thread,
            action,
            feedback,
            edits,
        } => {
            cmd::cmd_review(
                &project_dir,
                thread,
                action.as_deref(),
                feedback.as_deref(),
                edits.as_deref(),
                cli.verbose,
            )
            .await?;
        }
        Commands::State { thread, json } => cmd::cmd_state(&project_dir, thread, *json).await?,
        Commands::History { thread, json } => {
            cmd::cmd_history(&project_dir, thread, *json).await?
        }
        Commands::Replay { thread } => cmd::cmd_replay(&project_dir, thread).await?,
        Commands::Sessions { status, limit } => {
            cmd::cmd_sessions(&project_dir, status.as_deref(), *limit).await?
        }
        Commands::Delete { thread } => cmd::cmd_delete(&project_dir, thread).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
