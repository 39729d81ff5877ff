use super::result::JoinedResult;
use crate::admission::{Admission, AdmissionGate};
use crate::errors::PipelineError;
use crate::state::{PipelineState, StateStore};
use crate::worker::{WorkerInvocationRequest, WorkerResult, WorkerRuntime};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Slack allowed past the batch deadline for already-finished tasks to report.
const JOIN_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutConfig {
    /// Maximum number of workers running at once.
    pub max_width: usize,
    /// Deadline for the whole batch, permit waits included.
    pub join_timeout: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_width: 8,
            join_timeout: Duration::from_secs(300),
        }
    }
}

impl FanOutConfig {
    pub fn with_max_width(mut self, max_width: usize) -> Self {
        self.max_width = max_width.max(1);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Runs admitted batches of workers concurrently and joins their results.
pub struct FanOutCoordinator {
    gate: Arc<AdmissionGate>,
    runtime: Arc<dyn WorkerRuntime>,
    store: Arc<StateStore>,
    config: FanOutConfig,
}

impl FanOutCoordinator {
    pub fn new(
        gate: Arc<AdmissionGate>,
        runtime: Arc<dyn WorkerRuntime>,
        store: Arc<StateStore>,
        config: FanOutConfig,
    ) -> Self {
        Self {
            gate,
            runtime,
            store,
            config,
        }
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    /// Dispatch `requests` against `snapshot` and wait for all of them or the deadline.
    ///
    /// One failing worker never aborts the others. Workers still running at the
    /// deadline are detached and reported as timed out. If the store generation
    /// moved while the batch ran, every result comes back discarded.
    pub async fn dispatch(
        &self,
        snapshot: &PipelineState,
        requests: Vec<WorkerInvocationRequest>,
    ) -> Result<JoinedResult, PipelineError> {
        for request in &requests {
            request.validate()?;
        }
        let phase = snapshot.phase();
        if let Admission::Denied(reason) = self.gate.check_batch(&requests, phase) {
            warn!(phase = %phase, reason = %reason, "batch denied; nothing dispatched");
            return Err(PipelineError::PhaseViolation { phase, reason });
        }
        if requests.is_empty() {
            return Ok(JoinedResult::new(Vec::new(), snapshot.generation()));
        }

        let started = Instant::now();
        let total = requests.len();
        let join_timeout = self.config.join_timeout;
        let deadline = tokio::time::Instant::now() + join_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_width.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, WorkerResult)>(total);
        let worker_ids: Vec<String> = requests.iter().map(|r| r.worker_id.clone()).collect();

        info!(
            phase = %phase,
            workers = total,
            max_width = self.config.max_width,
            timeout_ms = join_timeout.as_millis() as u64,
            "dispatching batch"
        );

        for (index, request) in requests.into_iter().enumerate() {
            let tx = result_tx.clone();
            let semaphore = semaphore.clone();
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                let worker_started = Instant::now();
                let outcome = tokio::time::timeout_at(deadline, async {
                    let _permit = semaphore.acquire_owned().await?;
                    runtime.invoke(&request).await
                })
                .await;

                let result = match outcome {
                    Ok(Ok(output)) => WorkerResult::succeeded(&request.worker_id, output),
                    Ok(Err(e)) => WorkerResult::failed(&request.worker_id, format!("{e:#}")),
                    Err(_) => WorkerResult::timed_out(&request.worker_id, join_timeout),
                }
                .with_duration(worker_started.elapsed());

                debug!(worker = %request.worker_id, status = %result.status, "worker finished");
                // The receiver is gone once the batch has been joined.
                let _ = tx.send((index, result)).await;
            });
        }
        drop(result_tx);

        let mut slots: Vec<Option<WorkerResult>> = (0..total).map(|_| None).collect();
        let mut received = 0;
        while received < total {
            match tokio::time::timeout_at(deadline + JOIN_GRACE, result_rx.recv()).await {
                Ok(Some((index, result))) => {
                    slots[index] = Some(result);
                    received += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = total - received,
                        "join deadline passed; detaching outstanding workers"
                    );
                    break;
                }
            }
        }

        let results = slots
            .into_iter()
            .zip(worker_ids)
            .map(|(slot, id)| slot.unwrap_or_else(|| WorkerResult::timed_out(id, join_timeout)))
            .collect();
        let mut joined = JoinedResult::new(results, snapshot.generation());

        match self.store.current_generation() {
            Ok(current) if current != snapshot.generation() => {
                warn!(
                    snapshot = snapshot.generation(),
                    current, "pipeline moved during fan-out; discarding results"
                );
                joined.discard_stale(current);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not re-read generation at join"),
        }

        info!(
            succeeded = joined.success_count(),
            failed = joined.partial_failures.len(),
            stale = joined.stale,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch joined"
        );
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{AdmitOutcome, PhaseController};
    use crate::phase::Phase;
    use crate::worker::runtime::testing::{Behavior, ScriptedRuntime};
    use crate::worker::{CapabilityClass, InvocationMode, WorkerStatus};
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        gate: Arc<AdmissionGate>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            Self {
                store: Arc::new(StateStore::new(dir.path())),
                gate: Arc::new(AdmissionGate::default()),
                _dir: dir,
            }
        }

        fn coordinator(&self, runtime: ScriptedRuntime, config: FanOutConfig) -> FanOutCoordinator {
            FanOutCoordinator::new(
                self.gate.clone(),
                Arc::new(runtime),
                self.store.clone(),
                config,
            )
        }

        fn gathering(&self) -> PipelineState {
            let controller = PhaseController::new(self.store.clone(), self.gate.clone(), 3);
            let request = WorkerInvocationRequest::new("scout-1", CapabilityClass::Gather, "{}");
            match controller.admit(&request).unwrap() {
                AdmitOutcome::Allowed(state) => state,
                AdmitOutcome::Denied { .. } => panic!("gather must be admitted in IDLE"),
            }
        }
    }

    fn gather_batch(n: usize) -> Vec<WorkerInvocationRequest> {
        (1..=n)
            .map(|i| {
                WorkerInvocationRequest::new(format!("scout-{i}"), CapabilityClass::Gather, "{}")
                    .with_mode(InvocationMode::Parallel)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_batch() {
        let harness = Harness::new();
        let state = harness.gathering();
        let runtime = ScriptedRuntime::new()
            .reply("scout-1", "a")
            .reply("scout-2", "b")
            .fail("scout-3", "crashed")
            .reply("scout-4", "d");
        let coordinator = harness.coordinator(runtime, FanOutConfig::default());

        let joined = coordinator.dispatch(&state, gather_batch(4)).await.unwrap();
        assert_eq!(joined.success_count(), 3);
        assert_eq!(joined.partial_failures, vec!["scout-3"]);
        assert!(!joined.stale);
        assert_eq!(joined.results[2].status, WorkerStatus::Failed);
        assert!(joined.results[2].diagnostics[0].contains("crashed"));
    }

    #[tokio::test]
    async fn test_denied_batch_spawns_nothing() {
        let harness = Harness::new();
        let state = harness.gathering();
        let runtime = Arc::new(ScriptedRuntime::new().reply("builder", "x"));
        let coordinator = FanOutCoordinator::new(
            harness.gate.clone(),
            runtime.clone(),
            harness.store.clone(),
            FanOutConfig::default(),
        );
        let requests = vec![WorkerInvocationRequest::new(
            "builder",
            CapabilityClass::Execute,
            "{}",
        )];
        let err = coordinator.dispatch(&state, requests).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PhaseViolation {
                phase: Phase::Gathering,
                ..
            }
        ));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_returns_within_deadline() {
        let harness = Harness::new();
        let state = harness.gathering();
        let runtime = ScriptedRuntime::new()
            .reply("scout-1", "fast")
            .script(
                "scout-2",
                vec![Behavior::Sleep(Duration::from_secs(30), "slow".into())],
            );
        let config = FanOutConfig::default().with_join_timeout(Duration::from_millis(200));
        let coordinator = harness.coordinator(runtime, config);

        let started = Instant::now();
        let joined = coordinator.dispatch(&state, gather_batch(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(joined.results[0].status, WorkerStatus::Succeeded);
        assert_eq!(joined.results[1].status, WorkerStatus::TimedOut);
        assert_eq!(joined.partial_failures, vec!["scout-2"]);
    }

    #[tokio::test]
    async fn test_width_bounds_concurrency() {
        let harness = Harness::new();
        let state = harness.gathering();
        let mut runtime = ScriptedRuntime::new();
        for i in 1..=4 {
            runtime = runtime.script(
                &format!("scout-{i}"),
                vec![Behavior::Sleep(Duration::from_millis(100), format!("r{i}"))],
            );
        }
        let config = FanOutConfig::default().with_max_width(2);
        let coordinator = harness.coordinator(runtime, config);

        let started = Instant::now();
        let joined = coordinator.dispatch(&state, gather_batch(4)).await.unwrap();
        assert!(joined.all_succeeded());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_results_keep_request_order() {
        let harness = Harness::new();
        let state = harness.gathering();
        let runtime = ScriptedRuntime::new()
            .script(
                "scout-1",
                vec![Behavior::Sleep(Duration::from_millis(80), "first".into())],
            )
            .reply("scout-2", "second");
        let coordinator = harness.coordinator(runtime, FanOutConfig::default());
        let joined = coordinator.dispatch(&state, gather_batch(2)).await.unwrap();
        let ids: Vec<_> = joined.results.iter().map(|r| r.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["scout-1", "scout-2"]);
    }

    #[tokio::test]
    async fn test_reset_during_dispatch_discards_results() {
        let harness = Harness::new();
        let state = harness.gathering();
        let runtime = ScriptedRuntime::new().script(
            "scout-1",
            vec![Behavior::Sleep(Duration::from_millis(150), "late".into())],
        );
        let coordinator = harness.coordinator(runtime, FanOutConfig::default());

        let store = harness.store.clone();
        let resetter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.reset("operator").unwrap();
        });
        let joined = coordinator.dispatch(&state, gather_batch(1)).await.unwrap();
        resetter.await.unwrap();

        assert!(joined.stale);
        assert_eq!(joined.results[0].status, WorkerStatus::Discarded);
        assert_eq!(joined.success_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_trivially_joined() {
        let harness = Harness::new();
        let state = harness.gathering();
        let coordinator = harness.coordinator(ScriptedRuntime::new(), FanOutConfig::default());
        let joined = coordinator.dispatch(&state, Vec::new()).await.unwrap();
        assert!(joined.results.is_empty());
        assert!(joined.all_succeeded());
    }
}
