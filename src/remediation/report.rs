use crate::state::{FailureEvidence, PipelineState};
use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use uuid::Uuid;

/// What one review attempt tried and which criteria it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tried: String,
    pub failures: Vec<FailureEvidence>,
}

impl AttemptSummary {
    fn criteria(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.criterion.as_str()).collect()
    }
}

/// Everything an operator needs to take over a blocked task.
///
/// Rebuilt from durable history, so it survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub task_id: Uuid,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub attempts: Vec<AttemptSummary>,
    /// Criteria that failed in every attempt.
    pub persistent_failures: Vec<String>,
    /// Attempts failed on differing criteria.
    pub oscillating: bool,
    pub final_reason: String,
    pub generated_at: DateTime<Utc>,
}

impl EscalationReport {
    pub fn from_state(
        state: &PipelineState,
        max_attempts: u32,
        final_reason: impl Into<String>,
    ) -> Self {
        let attempts: Vec<AttemptSummary> = state
            .task_history()
            .iter()
            .filter(|record| record.is_review_failure())
            .enumerate()
            .map(|(i, record)| AttemptSummary {
                attempt: i as u32 + 1,
                timestamp: record.timestamp,
                tried: record.attempt_summary.clone().unwrap_or_default(),
                failures: record.evidence.clone(),
            })
            .collect();

        let persistent_failures = match attempts.split_first() {
            Some((first, rest)) => first
                .criteria()
                .into_iter()
                .filter(|c| rest.iter().all(|a| a.criteria().contains(c)))
                .map(String::from)
                .collect(),
            None => Vec::new(),
        };

        let oscillating = attempts.windows(2).any(|pair| {
            let mut a = pair[0].criteria();
            let mut b = pair[1].criteria();
            a.sort_unstable();
            b.sort_unstable();
            a != b
        });

        Self {
            task_id: state.task_id(),
            attempt_count: state.attempt_count(),
            max_attempts,
            attempts,
            persistent_failures,
            oscillating,
            final_reason: final_reason.into(),
            generated_at: Utc::now(),
        }
    }

    /// Human-readable form for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} task {} needs intervention",
            style("ESCALATION").red().bold(),
            self.task_id
        );
        let _ = writeln!(out, "  Reason:   {}", self.final_reason);
        let _ = writeln!(
            out,
            "  Attempts: {} of {}",
            self.attempt_count, self.max_attempts
        );
        for attempt in &self.attempts {
            let _ = writeln!(
                out,
                "  {} {}",
                style(format!("Attempt {}:", attempt.attempt)).bold(),
                attempt.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if !attempt.tried.is_empty() {
                let _ = writeln!(out, "    Tried: {}", attempt.tried);
            }
            for failure in &attempt.failures {
                let _ = writeln!(
                    out,
                    "    {} {}: {}",
                    style("✗").red(),
                    failure.criterion,
                    failure.evidence
                );
            }
        }
        if !self.persistent_failures.is_empty() {
            let _ = writeln!(
                out,
                "  Failing every attempt: {}",
                self.persistent_failures.join(", ")
            );
        }
        if self.oscillating {
            let _ = writeln!(
                out,
                "  {} attempts failed on different criteria",
                style("Oscillating:").yellow()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::state::{AttemptChange, Transition, TransitionRecord};

    fn failing_attempt(state: &mut PipelineState, to: Phase, failures: &[(&str, &str)]) {
        failing_attempt_that_tried(state, to, failures, "executed 1 of 1 step(s)");
    }

    fn failing_attempt_that_tried(
        state: &mut PipelineState,
        to: Phase,
        failures: &[(&str, &str)],
        tried: &str,
    ) {
        let mut from = state.phase();
        while from != Phase::Reviewing {
            let next = from.next().unwrap();
            let change = if next == Phase::Gathering && from == Phase::Idle {
                AttemptChange::Reset
            } else {
                AttemptChange::Keep
            };
            state.apply(
                Transition::new(TransitionRecord::new(from, next, "forward")).with_attempt_change(change),
            );
            from = next;
        }
        let evidence = failures
            .iter()
            .map(|(c, e)| FailureEvidence::new(*c, *e))
            .collect();
        state.apply(
            Transition::new(
                TransitionRecord::new(Phase::Reviewing, to, "review failed")
                    .with_evidence(evidence)
                    .with_attempt_summary(tried),
            )
            .with_attempt_change(AttemptChange::Increment),
        );
    }

    #[test]
    fn test_report_lists_every_attempt() {
        let mut state = PipelineState::fresh();
        failing_attempt(&mut state, Phase::Gathering, &[("no_regressions", "suite red")]);
        failing_attempt(&mut state, Phase::Gathering, &[("no_regressions", "still red")]);
        failing_attempt(&mut state, Phase::Blocked, &[("no_regressions", "red again")]);

        let report = EscalationReport::from_state(&state, 3, "budget exhausted");
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempt_count, 3);
        assert_eq!(report.persistent_failures, vec!["no_regressions"]);
        assert!(!report.oscillating);
        assert_eq!(report.attempts[2].failures[0].evidence, "red again");
        assert_eq!(report.task_id, state.task_id());
    }

    #[test]
    fn test_report_shows_what_each_attempt_tried() {
        let mut state = PipelineState::fresh();
        failing_attempt_that_tried(
            &mut state,
            Phase::Gathering,
            &[("verifiable", "1 failing")],
            "gathered by scout-a; executed by builder",
        );
        failing_attempt_that_tried(
            &mut state,
            Phase::Blocked,
            &[("verifiable", "still failing")],
            "gathered by scout-tests; executed by builder",
        );

        let report = EscalationReport::from_state(&state, 2, "budget exhausted");
        assert_eq!(report.attempts[0].tried, "gathered by scout-a; executed by builder");
        assert_eq!(report.attempts[1].tried, "gathered by scout-tests; executed by builder");
        let rendered = report.render();
        assert!(rendered.contains("Tried: gathered by scout-tests; executed by builder"));
        assert!(rendered.contains("still failing"));
    }

    #[test]
    fn test_oscillation_is_flagged() {
        let mut state = PipelineState::fresh();
        failing_attempt(&mut state, Phase::Gathering, &[("idiomatic", "a")]);
        failing_attempt(&mut state, Phase::Blocked, &[("verifiable", "b")]);

        let report = EscalationReport::from_state(&state, 2, "budget exhausted");
        assert!(report.oscillating);
        assert!(report.persistent_failures.is_empty());
    }

    #[test]
    fn test_previous_tasks_are_excluded() {
        let mut state = PipelineState::fresh();
        failing_attempt(&mut state, Phase::Blocked, &[("idiomatic", "old task")]);
        state.reset_to_idle("next task");
        failing_attempt(&mut state, Phase::Blocked, &[("verifiable", "new task")]);

        let report = EscalationReport::from_state(&state, 1, "budget exhausted");
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].failures[0].criterion, "verifiable");
    }

    #[test]
    fn test_report_without_review_failures() {
        let mut state = PipelineState::fresh();
        state.apply(
            Transition::new(TransitionRecord::new(Phase::Idle, Phase::Gathering, "admit"))
                .with_attempt_change(AttemptChange::Reset),
        );
        state.apply(Transition::new(TransitionRecord::new(
            Phase::Gathering,
            Phase::Blocked,
            "every gather worker failed",
        )));
        let report = EscalationReport::from_state(&state, 3, "every gather worker failed");
        assert!(report.attempts.is_empty());
        assert!(!report.oscillating);
        assert!(report.render().contains("every gather worker failed"));
    }
}
