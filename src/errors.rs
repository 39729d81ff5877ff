//! Typed error hierarchy for the pipeline.
//!
//! `PipelineError` is returned by the state, admission, controller and fan-out
//! layers. The orchestration and CLI layers wrap it in `anyhow` with context.
//! Error kinds fall into three groups:
//! - structural (`PhaseViolation`, `InvalidTransition`, `CorruptState`) surface immediately
//! - local (`WorkerFailure`, `ConcurrentModification`) are retried by the caller
//! - terminal (`MaxAttemptsExceeded`) stop the caller with an escalation report

use crate::admission::DenialReason;
use crate::phase::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes used by the CLI.
pub mod exit_codes {
    /// Success, `COMPLETE`, or an approved admission check.
    pub const SUCCESS: i32 = 0;
    /// Any error without a more specific code.
    pub const ERROR: i32 = 1;
    /// `BLOCKED`, escalation required, or a denied admission check.
    ///
    /// Phase violations outside `check` are misuse, not a blocked task, and
    /// exit with [`ERROR`].
    pub const BLOCKED: i32 = 2;
}

/// Errors from the pipeline subsystems.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase violation in {phase}: {reason}")]
    PhaseViolation { phase: Phase, reason: DenialReason },

    #[error("Concurrent modification: expected generation {expected}, found {found}")]
    ConcurrentModification { expected: u64, found: u64 },

    #[error("Corrupt pipeline state at {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error("Worker '{worker_id}' failed: {message}")]
    WorkerFailure { worker_id: String, message: String },

    #[error("{} of {total} workers failed: {}", .failed.len(), .failed.join(", "))]
    FanOutPartialFailure { failed: Vec<String>, total: usize },

    #[error("Review failed on: {}", .failed_criteria.join(", "))]
    ReviewFailure { failed_criteria: Vec<String> },

    #[error("Attempt budget exhausted after {attempts} of {max_attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32, max_attempts: u32 },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Worker registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Map the error to the CLI exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MaxAttemptsExceeded { .. } => exit_codes::BLOCKED,
            _ => exit_codes::ERROR,
        }
    }

    /// Whether the caller may retry after re-reading state or re-running a worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerFailure { .. } | Self::ConcurrentModification { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Resolve the exit code for an error surfaced at the CLI boundary.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PipelineError>()
        .map_or(exit_codes::ERROR, PipelineError::exit_code)
}
