//! Worker request and result types.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Closed set of worker capability classes.
///
/// The admission table maps each phase to the classes it accepts. `Utility`
/// workers bypass phase restriction entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    Gather,
    Refine,
    Plan,
    Execute,
    Review,
    Utility,
}

impl CapabilityClass {
    pub const ALL: [CapabilityClass; 6] = [
        CapabilityClass::Gather,
        CapabilityClass::Refine,
        CapabilityClass::Plan,
        CapabilityClass::Execute,
        CapabilityClass::Review,
        CapabilityClass::Utility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityClass::Gather => "gather",
            CapabilityClass::Refine => "refine",
            CapabilityClass::Plan => "plan",
            CapabilityClass::Execute => "execute",
            CapabilityClass::Review => "review",
            CapabilityClass::Utility => "utility",
        }
    }
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown capability class '{s}'. Valid: gather, refine, plan, execute, review, utility"
                )
            })
    }
}

/// Whether a request runs alongside others or alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    Parallel,
    #[default]
    Single,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationMode::Parallel => write!(f, "parallel"),
            InvocationMode::Single => write!(f, "single"),
        }
    }
}

/// A typed request to run one worker. Validated before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocationRequest {
    pub worker_id: String,
    pub capability_class: CapabilityClass,
    /// JSON document handed to the worker on stdin.
    pub input_context: String,
    #[serde(default)]
    pub mode: InvocationMode,
}

impl WorkerInvocationRequest {
    pub fn new(
        worker_id: impl Into<String>,
        capability_class: CapabilityClass,
        input_context: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            capability_class,
            input_context: input_context.into(),
            mode: InvocationMode::Single,
        }
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.worker_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "worker_id must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a single worker execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Result arrived after the pipeline moved on; never folded into state.
    Discarded,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Succeeded => write!(f, "succeeded"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::TimedOut => write!(f, "timed_out"),
            WorkerStatus::Discarded => write!(f, "discarded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    /// Number of executions behind this result, retries included.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl WorkerResult {
    pub fn succeeded(worker_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Succeeded,
            output: Some(output.into()),
            diagnostics: Vec::new(),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn failed(worker_id: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Failed,
            output: None,
            diagnostics: vec![diagnostic.into()],
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn timed_out(worker_id: impl Into<String>, limit: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::TimedOut,
            output: None,
            diagnostics: vec![format!("no result within {}ms", limit.as_millis())],
            attempts: 1,
            duration_ms: limit.as_millis() as u64,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Succeeded
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, WorkerStatus::Failed | WorkerStatus::TimedOut)
    }

    /// Mark the result as arriving too late to be used.
    pub fn discard(&mut self, note: impl Into<String>) {
        self.status = WorkerStatus::Discarded;
        self.diagnostics.push(note.into());
    }

    /// First diagnostic line, for log and report summaries.
    pub fn summary(&self) -> String {
        match (&self.status, self.diagnostics.first()) {
            (WorkerStatus::Succeeded, _) => "ok".to_string(),
            (status, Some(diag)) => format!("{status}: {diag}"),
            (status, None) => status.to_string(),
        }
    }
}
