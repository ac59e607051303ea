use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::{Config, LogFormat};
use conductor::engine::models::RunStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Runs coding-agent tasks in isolated workspaces with plan approval")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to conductor.toml (defaults to .conductor/conductor.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format. Overrides [logging].format.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .conductor/ with a default conductor.toml
    Init,
    /// Run a task against a repository: plan, approve, execute
    Run {
        /// Repository URL or local path
        #[arg(long)]
        repo: String,

        /// Branch, tag or full commit id to check out
        #[arg(long = "ref", default_value = "main")]
        reference: String,

        /// What the agent should do
        #[arg(long)]
        task: String,

        /// Thread that progress notifications are posted to
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Approve the plan without asking
        #[arg(short, long)]
        yes: bool,

        /// Use the scripted driver and an in-memory store
        #[arg(long)]
        dry_run: bool,
    },
    /// List recorded runs, newest first
    Runs {
        /// Only runs with this status (e.g. running, failed)
        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one run
    Show {
        /// Run id
        id: String,
    },
    /// Run counts by outcome
    Stats,
    /// Fail runs interrupted by a crash and remove orphan workspaces
    Sweep,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = Config::load(&project_dir, cli.config.as_deref(), None)?;
    let log_dir = config
        .toml
        .logging
        .dir
        .as_ref()
        .map(|dir| project_dir.join(dir));
    let _log_guard = conductor::logging::init(
        cli.verbose,
        cli.log_format.unwrap_or(config.toml.logging.format),
        log_dir.as_deref(),
    )?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Run {
            repo,
            reference,
            task,
            channel,
            yes,
            dry_run,
        } => {
            let args = cmd::RunArgs {
                repo: repo.clone(),
                reference: reference.clone(),
                task: task.clone(),
                channel: channel.clone(),
                yes: *yes,
                dry_run: *dry_run,
            };
            cmd::cmd_run(&config, args).await?;
        }
        Commands::Runs { status, limit } => cmd::cmd_runs(&config, *status, *limit).await?,
        Commands::Show { id } => cmd::cmd_show(&config, id).await?,
        Commands::Stats => cmd::cmd_stats(&config).await?,
        Commands::Sweep => cmd::cmd_sweep(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
