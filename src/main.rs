use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use phasegate::config::PipelineToml;
use phasegate::errors::exit_code_for;
use phasegate::init::{LOGS_DIR, get_state_dir, is_initialized};
use phasegate::logging::{LogGuards, LogOptions, init_logging};
use std::path::{Path, PathBuf};

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Phase-gated task orchestration pipeline")]
pub struct Cli {
    /// Increase console log detail (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .phasegate/ with default configuration and a sample worker registry
    Init,
    /// Drive a task through the pipeline until COMPLETE or BLOCKED
    Run {
        /// Task description handed to the gather workers
        #[arg(short, long)]
        task: String,

        /// Review failures tolerated before the task is blocked
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Deadline in seconds for each fan-out batch
        #[arg(long)]
        join_timeout: Option<u64>,

        /// Maximum workers running at once
        #[arg(long)]
        max_width: Option<usize>,
    },
    /// Show the current phase and attempt count
    Status,
    /// Dump the persisted state and its history
    Inspect {
        #[arg(long)]
        json: bool,
    },
    /// Force the pipeline back to IDLE
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        #[arg(long, default_value = "manual reset")]
        reason: String,
    },
    /// Check whether a worker may run in the current phase (reads JSON from stdin without --class)
    Check {
        /// Hook event being checked
        #[arg(long, value_enum, default_value_t = CheckEvent::Dispatch)]
        event: CheckEvent,

        #[arg(long)]
        class: Option<String>,

        #[arg(long)]
        worker: Option<String>,
    },
    /// List the worker registry
    Workers,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckEvent {
    /// A worker is about to be dispatched
    Dispatch,
    /// The session wants to stop
    Stop,
    /// A new session starts
    SessionStart,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and the worker registry
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run_cli(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn run_cli(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _guards = setup_logging(cli, &project_dir)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir),
        Commands::Run {
            task,
            max_attempts,
            join_timeout,
            max_width,
        } => {
            let overrides = phasegate::config::ConfigOverrides {
                max_attempts: *max_attempts,
                join_timeout_secs: *join_timeout,
                max_width: *max_width,
            };
            cmd::cmd_run(&project_dir, task, &overrides).await
        }
        Commands::Status => cmd::cmd_status(&project_dir),
        Commands::Inspect { json } => cmd::cmd_inspect(&project_dir, *json),
        Commands::Reset { force, reason } => cmd::cmd_reset(&project_dir, *force, reason),
        Commands::Check {
            event,
            class,
            worker,
        } => cmd::cmd_check(&project_dir, *event, class.as_deref(), worker.as_deref()),
        Commands::Workers => cmd::cmd_workers(&project_dir),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
    }
}

fn setup_logging(cli: &Cli, project_dir: &Path) -> Result<LogGuards> {
    let state_dir = get_state_dir(project_dir);
    // A broken pipeline.toml is reported by the command itself.
    let logging = PipelineToml::load_or_default(&state_dir)
        .map(|toml| toml.logging)
        .unwrap_or_default();
    let log_dir = (logging.file && is_initialized(project_dir)).then(|| state_dir.join(LOGS_DIR));
    let level = if logging.level.parse::<tracing::Level>().is_ok() {
        logging.level
    } else {
        LogOptions::default().level
    };

    init_logging(&LogOptions {
        verbosity: cli.verbose,
        json: cli.json_logs || logging.json,
        level,
        log_dir,
    })
}
