//! CLI errors and their process exit codes.

use std::path::PathBuf;

use keel_cortex::CortexError;
use keel_engine::EngineError;
use keel_types::{SpecError, WorkflowId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid workflow: {0}")]
    Spec(#[from] SpecError),

    #[error("could not parse workflow document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no recorded state for workflow {0}; run it first")]
    NoRecordedState(WorkflowId),

    #[error("workflow failed; see the event log for details")]
    RunFailed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Cortex(#[from] CortexError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    /// Short machine-readable code printed next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Spec(_) => "spec",
            CliError::Parse(_) => "parse",
            CliError::Io { .. } => "io",
            CliError::NoRecordedState(_) => "state",
            CliError::RunFailed => "failed",
            CliError::Engine(_) => "engine",
            CliError::Cortex(CortexError::Integrity { .. }) => "integrity",
            CliError::Cortex(CortexError::PolicyDenied { .. }) => "policy",
            CliError::Cortex(_) => "cortex",
            CliError::Other(_) => "internal",
        }
    }

    /// Process exit code. 0 is reserved for a successful run; 1 means
    /// the workflow executed and failed, 2 a configuration problem,
    /// 3 a snapshot integrity violation and 4 a policy denial.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Spec(_)
            | CliError::Parse(_)
            | CliError::Io { .. }
            | CliError::NoRecordedState(_)
            | CliError::Other(_) => 2,
            CliError::Cortex(CortexError::Integrity { .. }) => 3,
            CliError::Cortex(CortexError::PolicyDenied { .. }) => 4,
            CliError::Cortex(CortexError::SnapshotNotFound(_))
            | CliError::Cortex(CortexError::NoVerifiedSnapshot(_)) => 2,
            CliError::RunFailed | CliError::Engine(_) | CliError::Cortex(_) => 1,
        }
    }
}
