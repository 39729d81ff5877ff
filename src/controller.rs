//! Phase controller: the single authority over phase transitions.
//!
//! The controller turns admission decisions and phase outcomes into
//! transitions and commits them through the state store. It never writes the
//! state file itself.

use crate::admission::{Admission, AdmissionGate, DenialReason};
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::remediation::RemediationContext;
use crate::state::{AttemptChange, PipelineState, StateStore, Transition, TransitionRecord};
use crate::worker::{CapabilityClass, WorkerInvocationRequest};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a phase that the controller turns into a transition.
#[derive(Debug, Clone)]
pub enum PhaseSignal {
    GatherAccepted { reason: String },
    Refined { worker: String },
    Planned { steps: usize },
    Executed { reason: String },
    ReviewPassed,
    ReviewFailed(RemediationContext),
    Unrecoverable { reason: String },
}

impl PhaseSignal {
    fn expected_phase(&self) -> Option<Phase> {
        match self {
            PhaseSignal::GatherAccepted { .. } => Some(Phase::Gathering),
            PhaseSignal::Refined { .. } => Some(Phase::Refining),
            PhaseSignal::Planned { .. } => Some(Phase::Planning),
            PhaseSignal::Executed { .. } => Some(Phase::Executing),
            PhaseSignal::ReviewPassed | PhaseSignal::ReviewFailed(_) => Some(Phase::Reviewing),
            PhaseSignal::Unrecoverable { .. } => None,
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// Admitted; carries the state after any commit the admission caused.
    Allowed(PipelineState),
    Denied { phase: Phase, reason: DenialReason },
}

pub struct PhaseController {
    store: Arc<StateStore>,
    gate: Arc<AdmissionGate>,
    max_attempts: u32,
}

impl PhaseController {
    pub fn new(store: Arc<StateStore>, gate: Arc<AdmissionGate>, max_attempts: u32) -> Self {
        Self {
            store,
            gate,
            max_attempts,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn admit(&self, request: &WorkerInvocationRequest) -> Result<AdmitOutcome, PipelineError> {
        self.admit_batch(std::slice::from_ref(request))
    }

    /// Admit a batch against the persisted phase.
    ///
    /// Denied batches leave the state untouched. An admitted gather batch in
    /// `IDLE` starts a fresh task by committing `IDLE -> GATHERING`.
    pub fn admit_batch(
        &self,
        requests: &[WorkerInvocationRequest],
    ) -> Result<AdmitOutcome, PipelineError> {
        for request in requests {
            request.validate()?;
        }
        let state = self.store.load_or_recover()?;
        let phase = state.phase();

        if let Admission::Denied(reason) = self.gate.check_batch(requests, phase) {
            warn!(phase = %phase, reason = %reason, "admission denied");
            return Ok(AdmitOutcome::Denied { phase, reason });
        }

        let starts_task = phase == Phase::Idle
            && requests
                .iter()
                .any(|r| r.capability_class == CapabilityClass::Gather);
        if !starts_task {
            return Ok(AdmitOutcome::Allowed(state));
        }

        let workers: Vec<String> = requests.iter().map(|r| r.worker_id.clone()).collect();
        let mut record = TransitionRecord::new(
            Phase::Idle,
            Phase::Gathering,
            format!("admitted {} gather worker(s)", workers.len()),
        );
        if let Some(first) = workers.first() {
            record = record.with_worker(first.clone());
        }
        let transition = Transition::new(record)
            .with_active_workers(workers)
            .with_attempt_change(AttemptChange::Reset);
        let state = self.store.commit(&state, transition)?;
        info!(task_id = %state.task_id(), "task admitted");
        Ok(AdmitOutcome::Allowed(state))
    }

    /// Commit the transition implied by `signal` on top of `base`.
    pub fn advance(
        &self,
        base: &PipelineState,
        signal: PhaseSignal,
    ) -> Result<PipelineState, PipelineError> {
        self.advance_with(base, signal, Vec::new())
    }

    /// Like [`advance`](Self::advance), recording the workers the next phase
    /// dispatches. Terminal phases always end with no active workers.
    pub fn advance_with(
        &self,
        base: &PipelineState,
        signal: PhaseSignal,
        active_workers: Vec<String>,
    ) -> Result<PipelineState, PipelineError> {
        let transition = self
            .plan_transition(base, signal)?
            .with_active_workers(active_workers);
        self.store.commit(base, transition)
    }

    pub fn reset(&self, reason: &str) -> Result<PipelineState, PipelineError> {
        self.store.reset(reason)
    }

    /// Map a signal to a transition without touching the store.
    pub fn plan_transition(
        &self,
        base: &PipelineState,
        signal: PhaseSignal,
    ) -> Result<Transition, PipelineError> {
        let from = base.phase();
        if let Some(expected) = signal.expected_phase()
            && expected != from
        {
            let to = expected.next().unwrap_or(Phase::Blocked);
            return Err(PipelineError::InvalidTransition { from, to });
        }

        let transition = match signal {
            PhaseSignal::GatherAccepted { reason } | PhaseSignal::Executed { reason } => {
                Transition::new(TransitionRecord::new(from, self.next(from)?, reason))
            }
            PhaseSignal::Refined { worker } => Transition::new(
                TransitionRecord::new(from, self.next(from)?, "refined task context")
                    .with_worker(worker),
            ),
            PhaseSignal::Planned { steps } => Transition::new(TransitionRecord::new(
                from,
                self.next(from)?,
                format!("planned {steps} step(s)"),
            )),
            PhaseSignal::ReviewPassed => Transition::new(TransitionRecord::new(
                from,
                Phase::Complete,
                "all applicable review criteria passed",
            )),
            PhaseSignal::ReviewFailed(context) => {
                let attempts = base.attempt_count() + 1;
                let to = if attempts < self.max_attempts {
                    Phase::Gathering
                } else {
                    Phase::Blocked
                };
                let reason = format!(
                    "review failed on {}; attempt {attempts} of {}",
                    context.titles().join(", "),
                    self.max_attempts
                );
                Transition::new(
                    TransitionRecord::new(from, to, reason)
                        .with_evidence(context.evidence.clone())
                        .with_attempt_summary(context.prior_attempt_summary.clone()),
                )
                .with_attempt_change(AttemptChange::Increment)
            }
            PhaseSignal::Unrecoverable { reason } => {
                if from.is_terminal() {
                    return Err(PipelineError::InvalidTransition {
                        from,
                        to: Phase::Blocked,
                    });
                }
                Transition::new(TransitionRecord::new(from, Phase::Blocked, reason))
            }
        };
        Ok(transition)
    }

    fn next(&self, from: Phase) -> Result<Phase, PipelineError> {
        from.next().ok_or(PipelineError::InvalidTransition {
            from,
            to: Phase::Blocked,
        })
    }
}
