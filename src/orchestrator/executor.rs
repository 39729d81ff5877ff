//! Plan execution with bounded local retry.

use super::planner::{ExecutionPlan, PlanStep};
use crate::errors::PipelineError;
use crate::fanout::{FanOutCoordinator, JoinedResult};
use crate::state::PipelineState;
use crate::worker::{CapabilityClass, WorkerInvocationRequest, WorkerResult};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Local retry of failed workers with identical input.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Exponential backoff before retry `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Dispatch a batch, then re-run only the failed subset with identical input.
pub async fn dispatch_with_retry(
    coordinator: &FanOutCoordinator,
    snapshot: &PipelineState,
    requests: Vec<WorkerInvocationRequest>,
    policy: &RetryPolicy,
) -> Result<JoinedResult, PipelineError> {
    let mut joined = coordinator.dispatch(snapshot, requests.clone()).await?;
    for attempt in 1..=policy.max_retries {
        let failed = joined.failed_indices();
        if failed.is_empty() || joined.stale {
            break;
        }
        let retry: Vec<WorkerInvocationRequest> =
            failed.iter().map(|&i| requests[i].clone()).collect();
        let ids: Vec<&str> = retry.iter().map(|r| r.worker_id.as_str()).collect();
        warn!(attempt, workers = ?ids, "retrying failed workers");
        tokio::time::sleep(policy.backoff_for(attempt)).await;
        let retried = coordinator.dispatch(snapshot, retry).await?;
        joined.merge_retry(&failed, retried);
    }
    Ok(joined)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub goal_ids: Vec<String>,
    pub results: Vec<WorkerResult>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(WorkerResult::is_success)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub planned_steps: usize,
    pub steps: Vec<StepOutcome>,
    /// Why execution stopped early, if it did.
    pub aborted: Option<String>,
}

impl ExecutionResult {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
            && self.steps.len() == self.planned_steps
            && self.steps.iter().all(StepOutcome::succeeded)
    }

    /// `(worker_id, output)` for every successful worker, in execution order.
    pub fn outputs(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .flat_map(|s| s.results.iter())
            .filter(|r| r.is_success())
            .map(|r| (r.worker_id.as_str(), r.output.as_deref().unwrap_or_default()))
            .collect()
    }

    pub fn summary(&self) -> String {
        match &self.aborted {
            Some(reason) => format!(
                "executed {} of {} step(s); aborted: {reason}",
                self.steps.len(),
                self.planned_steps
            ),
            None => format!("executed {} of {} step(s)", self.steps.len(), self.planned_steps),
        }
    }
}

pub struct PlanExecutor<'a> {
    coordinator: &'a FanOutCoordinator,
    retry: RetryPolicy,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(coordinator: &'a FanOutCoordinator, retry: RetryPolicy) -> Self {
        Self { coordinator, retry }
    }

    /// Run the plan step by step. A step that still fails after retry aborts the plan.
    ///
    /// A stale join surfaces as `ConcurrentModification`; the caller must re-read state.
    pub async fn execute(
        &self,
        snapshot: &PipelineState,
        plan: &ExecutionPlan,
    ) -> Result<ExecutionResult, PipelineError> {
        let mut result = ExecutionResult {
            planned_steps: plan.steps.len(),
            ..Default::default()
        };
        let mut outputs: HashMap<String, String> = HashMap::new();

        for (index, step) in plan.steps.iter().enumerate() {
            let requests = step_requests(step, &outputs);
            let joined =
                dispatch_with_retry(self.coordinator, snapshot, requests, &self.retry).await?;
            if joined.stale {
                return Err(joined.stale_error());
            }

            for (assignment, worker_result) in step.assignments.iter().zip(&joined.results) {
                if let Some(output) = &worker_result.output
                    && worker_result.is_success()
                {
                    outputs.insert(assignment.goal.id.clone(), output.clone());
                }
            }

            let outcome = StepOutcome {
                index,
                goal_ids: step.assignments.iter().map(|a| a.goal.id.clone()).collect(),
                results: joined.results,
            };
            let succeeded = outcome.succeeded();
            result.steps.push(outcome);

            if !succeeded {
                let reason = format!(
                    "step {} failed after retry: {}",
                    index + 1,
                    joined.partial_failures.join(", ")
                );
                warn!(step = index + 1, "{reason}");
                result.aborted = Some(reason);
                break;
            }
            info!(step = index + 1, of = plan.steps.len(), "plan step completed");
        }
        Ok(result)
    }
}

fn step_requests(
    step: &PlanStep,
    outputs: &HashMap<String, String>,
) -> Vec<WorkerInvocationRequest> {
    step.assignments
        .iter()
        .map(|assignment| {
            let goal = &assignment.goal;
            let dependencies: HashMap<&str, &str> = goal
                .depends_on
                .iter()
                .filter_map(|dep| outputs.get(dep).map(|out| (dep.as_str(), out.as_str())))
                .collect();
            let input = json!({
                "goal": goal.id,
                "input": goal.input,
                "requires": goal.requires,
                "dependencies": dependencies,
            });
            let class = match goal.class {
                CapabilityClass::Utility => CapabilityClass::Utility,
                _ => CapabilityClass::Execute,
            };
            WorkerInvocationRequest::new(&assignment.worker_id, class, input.to_string())
                .with_mode(step.mode)
        })
        .collect()
}
