use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the persisted state layout.
pub const SCHEMA_VERSION: u32 = 1;

/// One failed review criterion and what showed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvidence {
    pub criterion: String,
    pub evidence: String,
}

impl FailureEvidence {
    pub fn new(criterion: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            criterion: criterion.into(),
            evidence: evidence.into(),
        }
    }
}

/// An entry in the append-only phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_worker: Option<String>,
    pub reason: String,
    /// Failed criteria carried when leaving `REVIEWING` after a failed review.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<FailureEvidence>,
    /// What the failed attempt did: execution summary and the workers involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_summary: Option<String>,
}

impl TransitionRecord {
    pub fn new(from_phase: Phase, to_phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            from_phase,
            to_phase,
            timestamp: Utc::now(),
            triggering_worker: None,
            reason: reason.into(),
            evidence: Vec::new(),
            attempt_summary: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.triggering_worker = Some(worker_id.into());
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<FailureEvidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_attempt_summary(mut self, summary: impl Into<String>) -> Self {
        self.attempt_summary = Some(summary.into());
        self
    }

    /// Whether this record starts a new task.
    pub fn starts_task(&self) -> bool {
        self.from_phase == Phase::Idle && self.to_phase == Phase::Gathering
    }

    /// Whether this record leaves `REVIEWING` after a failed review.
    pub fn is_review_failure(&self) -> bool {
        self.from_phase == Phase::Reviewing
            && matches!(self.to_phase, Phase::Gathering | Phase::Blocked)
            && !self.evidence.is_empty()
    }
}

/// How a commit changes the attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptChange {
    #[default]
    Keep,
    Increment,
    /// Start a fresh task: zero the counter and assign a new task id.
    Reset,
}

/// A proposed state change, applied only through `StateStore::commit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: TransitionRecord,
    pub active_workers: Vec<String>,
    pub attempt_change: AttemptChange,
}

impl Transition {
    pub fn new(record: TransitionRecord) -> Self {
        Self {
            record,
            active_workers: Vec::new(),
            attempt_change: AttemptChange::Keep,
        }
    }

    pub fn with_active_workers(mut self, workers: Vec<String>) -> Self {
        self.active_workers = workers;
        self
    }

    pub fn with_attempt_change(mut self, change: AttemptChange) -> Self {
        self.attempt_change = change;
        self
    }
}

/// The persisted state of the pipeline. Only the state store mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    schema_version: u32,
    task_id: Uuid,
    phase: Phase,
    history: Vec<TransitionRecord>,
    active_workers: Vec<String>,
    attempt_count: u32,
    generation: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// A fresh `IDLE` state with empty history.
    pub fn fresh() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: Uuid::new_v4(),
            phase: Phase::Idle,
            history: Vec::new(),
            active_workers: Vec::new(),
            attempt_count: 0,
            generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn active_workers(&self) -> &[String] {
        &self.active_workers
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.last()
    }

    /// History of the current task: everything from its `IDLE -> GATHERING` record on.
    pub fn task_history(&self) -> &[TransitionRecord] {
        let start = self
            .history
            .iter()
            .rposition(TransitionRecord::starts_task)
            .unwrap_or(0);
        &self.history[start..]
    }

    /// Check structural consistency of a loaded state.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "schema_version {} is not supported (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        match self.history.last() {
            Some(last) if last.to_phase != self.phase => {
                return Err(format!(
                    "phase {} disagrees with last history entry ({} -> {})",
                    self.phase, last.from_phase, last.to_phase
                ));
            }
            None if self.phase != Phase::Idle => {
                return Err(format!("phase {} with empty history", self.phase));
            }
            _ => {}
        }
        for pair in self.history.windows(2) {
            if pair[0].to_phase != pair[1].from_phase {
                return Err(format!(
                    "history is discontinuous at {} -> {}",
                    pair[0].to_phase, pair[1].from_phase
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, transition: Transition) {
        let Transition {
            record,
            active_workers,
            attempt_change,
        } = transition;
        match attempt_change {
            AttemptChange::Keep => {}
            AttemptChange::Increment => self.attempt_count += 1,
            AttemptChange::Reset => {
                self.attempt_count = 0;
                self.task_id = Uuid::new_v4();
            }
        }
        self.phase = record.to_phase;
        self.active_workers = if record.to_phase.is_terminal() {
            Vec::new()
        } else {
            active_workers
        };
        self.history.push(record);
        self.generation += 1;
        self.updated_at = Utc::now();
    }

    pub(crate) fn reset_to_idle(&mut self, reason: &str) {
        let record = TransitionRecord::new(self.phase, Phase::Idle, format!("reset: {reason}"));
        self.phase = Phase::Idle;
        self.active_workers.clear();
        self.history.push(record);
        self.generation += 1;
        self.updated_at = Utc::now();
    }
}
