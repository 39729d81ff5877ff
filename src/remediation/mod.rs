//! Bounded remediation after a failed review.
//!
//! A failed review produces a [`RemediationContext`] that seeds the next
//! gathering pass. Every failure costs one attempt from a single shared budget;
//! when the budget runs out the task is blocked and an [`EscalationReport`] is
//! produced instead.

pub mod report;

pub use report::{AttemptSummary, EscalationReport};

use crate::controller::{PhaseController, PhaseSignal};
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::review::{Criterion, ReviewSummary};
use crate::state::{FailureEvidence, PipelineState};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What the next gathering pass needs to know about the last failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationContext {
    /// Attempt number this context was produced by (1-based).
    pub attempt: u32,
    pub prior_attempt_summary: String,
    pub failed_criteria: Vec<Criterion>,
    pub root_cause_hints: Vec<String>,
    pub evidence: Vec<FailureEvidence>,
}

impl RemediationContext {
    pub fn from_review(
        attempt: u32,
        summary: &ReviewSummary,
        prior_attempt_summary: impl Into<String>,
    ) -> Self {
        let failures = summary.failures();
        Self {
            attempt,
            prior_attempt_summary: prior_attempt_summary.into(),
            failed_criteria: failures.iter().map(|v| v.criterion).collect(),
            root_cause_hints: failures
                .iter()
                .filter(|v| !v.evidence.is_empty())
                .map(|v| format!("{}: {}", v.criterion.title(), v.evidence))
                .collect(),
            evidence: summary.evidence(),
        }
    }

    pub fn titles(&self) -> Vec<&'static str> {
        self.failed_criteria.iter().map(Criterion::title).collect()
    }

    /// Worker tags that mark a gatherer as targeting one of the failed criteria.
    pub fn target_tags(&self) -> Vec<String> {
        self.failed_criteria
            .iter()
            .flat_map(|c| [c.worker_tag(), c.id().to_string()])
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum RemediationDecision {
    /// Re-enter `GATHERING` with the context as seed input.
    Retry {
        context: RemediationContext,
        state: PipelineState,
    },
    /// Budget exhausted; the task is `BLOCKED`.
    Escalate {
        report: EscalationReport,
        state: PipelineState,
    },
}

pub struct RemediationLoop {
    max_attempts: u32,
}

impl RemediationLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Charge one attempt for a failed review and decide where the task goes next.
    ///
    /// `regather` names the gather workers a retry dispatches for the context;
    /// they become the active workers of the new `GATHERING` phase.
    pub fn remediate<F>(
        &self,
        controller: &PhaseController,
        state: &PipelineState,
        summary: &ReviewSummary,
        prior_attempt_summary: &str,
        regather: F,
    ) -> Result<RemediationDecision, PipelineError>
    where
        F: FnOnce(&RemediationContext) -> Vec<String>,
    {
        let context =
            RemediationContext::from_review(state.attempt_count() + 1, summary, prior_attempt_summary);
        let workers = regather(&context);
        let next =
            controller.advance_with(state, PhaseSignal::ReviewFailed(context.clone()), workers)?;

        if next.phase() == Phase::Blocked {
            let reason = PipelineError::MaxAttemptsExceeded {
                attempts: next.attempt_count(),
                max_attempts: self.max_attempts,
            }
            .to_string();
            warn!(task_id = %next.task_id(), attempts = next.attempt_count(), "{reason}");
            let report = self.escalation_report(&next, reason);
            return Ok(RemediationDecision::Escalate {
                report,
                state: next,
            });
        }

        info!(
            attempt = next.attempt_count(),
            max_attempts = self.max_attempts,
            failed = ?context.titles(),
            "re-entering GATHERING for remediation"
        );
        Ok(RemediationDecision::Retry {
            context,
            state: next,
        })
    }

    pub fn escalation_report(
        &self,
        state: &PipelineState,
        final_reason: impl Into<String>,
    ) -> EscalationReport {
        EscalationReport::from_state(state, self.max_attempts, final_reason)
    }
}
