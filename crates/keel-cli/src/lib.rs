//! Keel command line interface
//!
//! Three subcommands cover the operator surface:
//!
//! - `keel run <workflow.yaml>` — validate and execute a workflow,
//!   persisting committed state, snapshots and the event log under a
//!   per-workflow state directory so later invocations resume instead
//!   of re-running settled tasks.
//! - `keel rollback --task <workflow> --to <snapshot>` — restore the
//!   recorded world to an earlier snapshot as a human principal.
//! - `keel inspect <workflow.yaml>` — validate a document and print the
//!   execution plan without running anything.
//!
//! The binary exits 0 only when a run succeeds; 1 when the workflow
//! executed and failed, 2 for configuration problems, 3 for snapshot
//! integrity violations and 4 for policy denials.

#![deny(unsafe_code)]

mod commands;
mod errors;

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use errors::{CliError, CliResult};

#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Orchestration kernel for autonomous software agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow document end to end.
    Run(RunArgs),

    /// Restore committed state from a recorded snapshot.
    Rollback(RollbackArgs),

    /// Validate a workflow document and print the execution plan.
    Inspect {
        /// Path to the workflow YAML document.
        file: PathBuf,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML document.
    pub file: PathBuf,

    /// Directory holding per-workflow run state and event logs.
    #[arg(long, default_value = "./var/run")]
    pub state_dir: PathBuf,

    /// Principal the workflow runs as.
    #[arg(long, default_value = "operator")]
    pub principal: String,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Workflow whose committed state should be rolled back.
    #[arg(long = "task")]
    pub workflow: String,

    /// Snapshot to restore, as recorded in the snapshot index.
    #[arg(long = "to")]
    pub snapshot: String,

    /// Human principal performing the rollback.
    #[arg(long, default_value = "operator")]
    pub user: String,

    /// Directory holding per-workflow run state and event logs.
    #[arg(long, default_value = "./var/run")]
    pub state_dir: PathBuf,
}

/// Entry point for the `keel` binary.
pub async fn run() -> CliResult<()> {
    run_with_args(std::env::args()).await
}

/// Parse `args` and dispatch to the matching subcommand. Split out of
/// [`run`] so tests can drive the CLI in-process.
pub async fn run_with_args<I, T>(args: I) -> CliResult<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    init_tracing();

    let cli = Cli::parse_from(args);
    match cli.command {
        Commands::Run(args) => commands::run(args).await,
        Commands::Rollback(args) => commands::rollback(args),
        Commands::Inspect { file } => commands::inspect(&file),
    }
}

fn init_tracing() {
    // try_init: tests invoke run_with_args repeatedly in one process
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init();
}
