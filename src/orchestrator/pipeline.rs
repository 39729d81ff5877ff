//! End-to-end driver: admit, gather, refine, plan, execute, review, remediate.

use super::executor::{ExecutionResult, PlanExecutor, RetryPolicy, dispatch_with_retry};
use super::planner::{ExecutionPlan, Planner};
use crate::admission::AdmissionGate;
use crate::audit::ArchiveLogger;
use crate::config::PipelineConfig;
use crate::controller::{AdmitOutcome, PhaseController, PhaseSignal};
use crate::errors::{PipelineError, exit_codes};
use crate::fanout::{FanOutCoordinator, JoinedResult};
use crate::phase::Phase;
use crate::remediation::{
    EscalationReport, RemediationContext, RemediationDecision, RemediationLoop,
};
use crate::review::{Criterion, ReviewGate};
use crate::state::{PipelineState, StateStore};
use crate::worker::{
    CapabilityClass, InvocationMode, WorkerEntry, WorkerInvocationRequest, WorkerRegistry,
    WorkerRuntime,
};
use anyhow::{Context, Result, bail};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How a pipeline run ended.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Complete {
        state: PipelineState,
        execution: ExecutionResult,
    },
    Blocked {
        state: PipelineState,
        report: EscalationReport,
    },
}

impl PipelineOutcome {
    pub fn state(&self) -> &PipelineState {
        match self {
            PipelineOutcome::Complete { state, .. } | PipelineOutcome::Blocked { state, .. } => {
                state
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, PipelineOutcome::Complete { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Complete { .. } => exit_codes::SUCCESS,
            PipelineOutcome::Blocked { .. } => exit_codes::BLOCKED,
        }
    }
}

/// Result of one phase: carry on with the new state, or stop the run.
enum Stage<T> {
    Next(PipelineState, T),
    Halt(PipelineOutcome),
}

pub struct Pipeline {
    controller: Arc<PhaseController>,
    coordinator: Arc<FanOutCoordinator>,
    registry: Arc<WorkerRegistry>,
    planner: Planner,
    review: ReviewGate,
    remediation: RemediationLoop,
    retry: RetryPolicy,
    accept_partial: bool,
    archive: Option<ArchiveLogger>,
}

impl Pipeline {
    pub fn new(
        controller: Arc<PhaseController>,
        coordinator: Arc<FanOutCoordinator>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let max_attempts = controller.max_attempts();
        Self {
            planner: Planner::new(registry.clone()),
            review: ReviewGate::new(coordinator.clone(), registry.clone()),
            remediation: RemediationLoop::new(max_attempts),
            controller,
            coordinator,
            registry,
            retry: RetryPolicy::default(),
            accept_partial: true,
            archive: None,
        }
    }

    /// Wire every component from resolved configuration.
    pub fn from_config(
        config: &PipelineConfig,
        registry: Arc<WorkerRegistry>,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Result<Self> {
        let table = config
            .toml
            .admission_table()
            .context("Invalid [admission] configuration")?;
        let delegates = config
            .toml
            .review_delegates()
            .context("Invalid [review.delegate] configuration")?;

        let gate = Arc::new(AdmissionGate::new(table));
        let store = Arc::new(StateStore::new(&config.state_dir));
        let controller = Arc::new(PhaseController::new(
            store.clone(),
            gate.clone(),
            config.max_attempts(),
        ));
        let coordinator = Arc::new(FanOutCoordinator::new(
            gate,
            runtime,
            store,
            config.fanout(),
        ));

        Ok(Self::new(controller, coordinator, registry)
            .with_retry(config.retry_policy())
            .with_accept_partial(config.accept_partial())
            .with_delegates(delegates)
            .with_archive(ArchiveLogger::new(&config.state_dir)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_accept_partial(mut self, accept_partial: bool) -> Self {
        self.accept_partial = accept_partial;
        self
    }

    pub fn with_delegates(mut self, delegates: HashMap<Criterion, String>) -> Self {
        self.review = self.review.with_delegates(delegates);
        self
    }

    pub fn with_archive(mut self, archive: ArchiveLogger) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn controller(&self) -> &PhaseController {
        &self.controller
    }

    /// Drive `task` from `IDLE` to `COMPLETE` or `BLOCKED`.
    pub async fn run(&self, task: &str) -> Result<PipelineOutcome> {
        let missing = self.registry.missing_required_classes();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(CapabilityClass::as_str).collect();
            return Err(PipelineError::Registry(format!(
                "no workers registered for class(es): {}",
                names.join(", ")
            ))
            .into());
        }

        let mut state = self.admit(task)?;
        info!(task_id = %state.task_id(), "pipeline started");
        let mut seed: Option<RemediationContext> = None;

        loop {
            let gatherers = worker_ids(&self.gather_targets(seed.as_ref()));
            let (next, findings) = match self.gather(&state, task, seed.as_ref()).await? {
                Stage::Next(state, findings) => (state, findings),
                Stage::Halt(outcome) => return Ok(outcome),
            };
            let (next, refined) = match self.refine(&next, &findings).await? {
                Stage::Next(state, refined) => (state, refined),
                Stage::Halt(outcome) => return Ok(outcome),
            };
            let (next, plan) = match self.plan(&next, &refined).await? {
                Stage::Next(state, plan) => (state, plan),
                Stage::Halt(outcome) => return Ok(outcome),
            };

            let execution = PlanExecutor::new(&self.coordinator, self.retry.clone())
                .execute(&next, &plan)
                .await?;
            let reviewers = self
                .review
                .assignments()
                .into_iter()
                .map(|(worker, _)| worker)
                .collect();
            let next = self.controller.advance_with(
                &next,
                PhaseSignal::Executed {
                    reason: execution.summary(),
                },
                reviewers,
            )?;

            let summary = self.review.review(&next, &plan, &execution).await?;
            if summary.passed() {
                let done = self.controller.advance(&next, PhaseSignal::ReviewPassed)?;
                info!(task_id = %done.task_id(), attempts = done.attempt_count(), "task complete");
                self.archive_state(&done);
                return Ok(PipelineOutcome::Complete {
                    state: done,
                    execution,
                });
            }

            let tried = format!(
                "{}; gathered by {}; executed by {}",
                execution.summary(),
                gatherers.join(", "),
                plan_workers(&plan).join(", ")
            );
            match self.remediation.remediate(
                &self.controller,
                &next,
                &summary,
                &tried,
                |context| worker_ids(&self.gather_targets(Some(context))),
            )? {
                RemediationDecision::Retry { context, state: s } => {
                    state = s;
                    seed = Some(context);
                }
                RemediationDecision::Escalate { report, state } => {
                    self.record_escalation(&state, &report);
                    return Ok(PipelineOutcome::Blocked { state, report });
                }
            }
        }
    }

    fn admit(&self, task: &str) -> Result<PipelineState> {
        let current = self.controller.store().load_or_recover()?;
        let phase = current.phase();
        if phase != Phase::Idle && !phase.is_terminal() {
            bail!(
                "task {} is already in phase {phase}; run `phasegate reset` first",
                current.task_id()
            );
        }

        let workers = self.registry.by_class(CapabilityClass::Gather);
        let requests = batch_requests(&workers, CapabilityClass::Gather, &gather_input(task, None));
        match self.controller.admit_batch(&requests)? {
            AdmitOutcome::Allowed(state) => Ok(state),
            AdmitOutcome::Denied { phase, reason } => {
                Err(PipelineError::PhaseViolation { phase, reason })
                    .context("Reset the pipeline before starting a new task")
            }
        }
    }

    /// Gather workers for a pass: those tagged for the failed criteria when
    /// remediating, falling back to every gatherer.
    fn gather_targets(&self, seed: Option<&RemediationContext>) -> Vec<&WorkerEntry> {
        let all = self.registry.by_class(CapabilityClass::Gather);
        match seed {
            Some(context) => {
                let tags = context.target_tags();
                let targeted: Vec<&WorkerEntry> = all
                    .iter()
                    .copied()
                    .filter(|w| tags.iter().any(|t| w.has_tag(t)))
                    .collect();
                if targeted.is_empty() { all } else { targeted }
            }
            None => all,
        }
    }

    async fn gather(
        &self,
        state: &PipelineState,
        task: &str,
        seed: Option<&RemediationContext>,
    ) -> Result<Stage<String>> {
        let workers = self.gather_targets(seed);
        let input = gather_input(task, seed);
        let requests = batch_requests(&workers, CapabilityClass::Gather, &input);
        let joined = self.dispatch(state, requests).await?;

        let total = joined.results.len();
        let succeeded = joined.success_count();
        if succeeded == 0 {
            let reason = format!(
                "every gather worker failed: {}",
                joined.partial_failures.join(", ")
            );
            return self.block(state, reason).map(Stage::Halt);
        }

        let reason = if joined.all_succeeded() {
            format!("gathered {succeeded} result(s)")
        } else if self.accept_partial {
            warn!(succeeded, total, failed = ?joined.partial_failures, "accepting partial gather results");
            format!(
                "accepted partial gather: {succeeded} of {total} succeeded; failed: {}",
                joined.partial_failures.join(", ")
            )
        } else {
            let reason = joined
                .require_all()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            return self.block(state, reason).map(Stage::Halt);
        };

        let findings: Vec<_> = joined
            .outputs()
            .into_iter()
            .map(|(worker, output)| json!({ "worker": worker, "output": output }))
            .collect();
        let gathered = json!({
            "task": task,
            "findings": findings,
            "remediation": seed,
        })
        .to_string();

        let refiner = self.selected(CapabilityClass::Refine);
        let next =
            self.controller
                .advance_with(state, PhaseSignal::GatherAccepted { reason }, refiner)?;
        Ok(Stage::Next(next, gathered))
    }

    async fn refine(&self, state: &PipelineState, findings: &str) -> Result<Stage<String>> {
        let Some(worker) = self.planner.select_worker(CapabilityClass::Refine, &[]) else {
            return self
                .block(state, "no refine worker registered".to_string())
                .map(Stage::Halt);
        };
        let worker_id = worker.id.clone();
        let request = WorkerInvocationRequest::new(&worker_id, CapabilityClass::Refine, findings);
        let joined = self.dispatch(state, vec![request]).await?;

        let Some((_, refined)) = joined.outputs().first().copied() else {
            let reason = format!("refine worker failed: {}", failure_summary(&joined));
            return self.block(state, reason).map(Stage::Halt);
        };
        let refined = refined.to_string();

        let planner = self.selected(CapabilityClass::Plan);
        let next = self.controller.advance_with(
            state,
            PhaseSignal::Refined { worker: worker_id },
            planner,
        )?;
        Ok(Stage::Next(next, refined))
    }

    async fn plan(&self, state: &PipelineState, refined: &str) -> Result<Stage<ExecutionPlan>> {
        let mut goal_source = refined.to_string();
        if let Some(worker) = self.planner.select_worker(CapabilityClass::Plan, &[]) {
            let request = WorkerInvocationRequest::new(&worker.id, CapabilityClass::Plan, refined);
            let joined = self.dispatch(state, vec![request]).await?;
            match joined.outputs().first() {
                Some((_, output)) => goal_source = output.to_string(),
                None => {
                    let reason = format!("plan worker failed: {}", failure_summary(&joined));
                    return self.block(state, reason).map(Stage::Halt);
                }
            }
        }

        let plan = match self.planner.plan(&goal_source) {
            Ok(plan) => plan,
            Err(e) => return self.block(state, e.to_string()).map(Stage::Halt),
        };
        info!(steps = plan.steps.len(), goals = plan.goal_count(), "execution plan ready");

        let next = self.controller.advance_with(
            state,
            PhaseSignal::Planned {
                steps: plan.steps.len(),
            },
            plan_workers(&plan),
        )?;
        Ok(Stage::Next(next, plan))
    }

    /// The worker a single-worker phase will dispatch, if one is registered.
    fn selected(&self, class: CapabilityClass) -> Vec<String> {
        self.planner
            .select_worker(class, &[])
            .map(|w| w.id.clone())
            .into_iter()
            .collect()
    }

    /// Dispatch with local retry. A stale join means another actor moved the state.
    async fn dispatch(
        &self,
        state: &PipelineState,
        requests: Vec<WorkerInvocationRequest>,
    ) -> Result<JoinedResult> {
        let joined = dispatch_with_retry(&self.coordinator, state, requests, &self.retry).await?;
        if joined.stale {
            return Err(joined.stale_error().into());
        }
        Ok(joined)
    }

    fn block(&self, state: &PipelineState, reason: String) -> Result<PipelineOutcome> {
        warn!(phase = %state.phase(), "{reason}");
        let blocked = self.controller.advance(
            state,
            PhaseSignal::Unrecoverable {
                reason: reason.clone(),
            },
        )?;
        let report = self.remediation.escalation_report(&blocked, reason);
        self.record_escalation(&blocked, &report);
        Ok(PipelineOutcome::Blocked {
            state: blocked,
            report,
        })
    }

    fn record_escalation(&self, state: &PipelineState, report: &EscalationReport) {
        if let Some(archive) = &self.archive
            && let Err(e) = archive.write_escalation(report)
        {
            warn!(error = %e, "failed to write escalation report");
        }
        self.archive_state(state);
    }

    fn archive_state(&self, state: &PipelineState) {
        if let Some(archive) = &self.archive
            && let Err(e) = archive.archive(state)
        {
            warn!(error = %e, "failed to archive task state");
        }
    }
}

fn gather_input(task: &str, seed: Option<&RemediationContext>) -> String {
    json!({ "task": task, "remediation": seed }).to_string()
}

fn worker_ids(workers: &[&WorkerEntry]) -> Vec<String> {
    workers.iter().map(|w| w.id.clone()).collect()
}

/// Distinct execute workers in plan order.
fn plan_workers(plan: &ExecutionPlan) -> Vec<String> {
    let mut workers: Vec<String> = Vec::new();
    for worker in plan.steps.iter().flat_map(|step| step.workers()) {
        if !workers.iter().any(|w| w == worker) {
            workers.push(worker.to_string());
        }
    }
    workers
}

fn batch_requests(
    workers: &[&WorkerEntry],
    class: CapabilityClass,
    input: &str,
) -> Vec<WorkerInvocationRequest> {
    let mode = if workers.len() > 1 {
        InvocationMode::Parallel
    } else {
        InvocationMode::Single
    };
    workers
        .iter()
        .map(|w| WorkerInvocationRequest::new(&w.id, class, input).with_mode(mode))
        .collect()
}

fn failure_summary(joined: &JoinedResult) -> String {
    joined
        .results
        .iter()
        .map(|r| r.summary())
        .collect::<Vec<_>>()
        .join("; ")
}
