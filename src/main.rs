use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use autoforge::client::Backend;

mod cmd;

#[derive(Parser)]
#[command(name = "autoforge")]
#[command(version, about = "Autonomous coding supervisor")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project to drive (defaults to the current directory)
    #[arg(long, global = true, env = "AUTOFORGE_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent until every feature passes and the build is clean
    Run {
        /// Skip tool-permission prompts
        #[arg(long)]
        yolo: bool,

        /// Model passed to the backend
        #[arg(long)]
        model: Option<String>,

        /// Override the configured backend
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        /// Serve observer WebSockets on this address (e.g. 127.0.0.1:3141)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Show lock state, feature counts and the next phase
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Report run-locks left behind by dead agents
    Reconcile {
        /// Delete the orphaned locks that were found
        #[arg(long)]
        clear: bool,
    },
    /// Probe the configured backend once
    Check {
        #[arg(long)]
        model: Option<String>,

        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },
    /// View, validate or create autoforge.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default autoforge.toml and export the prompt templates
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            yolo,
            model,
            backend,
            listen,
        } => {
            cmd::cmd_run(
                &project_dir,
                cli.verbose,
                cmd::RunArgs {
                    yolo: *yolo,
                    model: model.clone(),
                    backend: *backend,
                    listen: listen.clone(),
                },
            )
            .await?
        }
        Commands::Status { json } => cmd::cmd_status(&project_dir, cli.verbose, *json).await?,
        Commands::Reconcile { clear } => cmd::cmd_reconcile(&project_dir, cli.verbose, *clear)?,
        Commands::Check { model, backend } => {
            cmd::cmd_check(&project_dir, cli.verbose, *backend, model.clone()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
