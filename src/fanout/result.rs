use crate::errors::PipelineError;
use crate::worker::WorkerResult;
use serde::{Deserialize, Serialize};

/// Results of one fan-out batch, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedResult {
    pub results: Vec<WorkerResult>,
    /// Worker ids that failed or timed out.
    pub partial_failures: Vec<String>,
    /// Generation of the snapshot the batch was dispatched against.
    pub generation: u64,
    /// The store moved on while the batch ran; every result is discarded.
    pub stale: bool,
    /// Store generation observed at join.
    pub observed_generation: u64,
}

impl JoinedResult {
    pub fn new(results: Vec<WorkerResult>, generation: u64) -> Self {
        let mut joined = Self {
            results,
            partial_failures: Vec::new(),
            generation,
            stale: false,
            observed_generation: generation,
        };
        joined.refresh_failures();
        joined
    }

    pub fn all_succeeded(&self) -> bool {
        !self.stale && self.results.iter().all(WorkerResult::is_success)
    }

    pub fn successes(&self) -> impl Iterator<Item = &WorkerResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    /// Indices of failed or timed-out results.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_failure())
            .map(|(i, _)| i)
            .collect()
    }

    /// Outputs of the successful results, in request order.
    pub fn outputs(&self) -> Vec<(&str, &str)> {
        self.successes()
            .map(|r| (r.worker_id.as_str(), r.output.as_deref().unwrap_or_default()))
            .collect()
    }

    /// Require every worker to have succeeded.
    pub fn require_all(&self) -> Result<(), PipelineError> {
        if self.partial_failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::FanOutPartialFailure {
                failed: self.partial_failures.clone(),
                total: self.results.len(),
            })
        }
    }

    /// Fold a retry of the results at `indices` back into this batch.
    ///
    /// `retried` must hold one result per index, in the same order.
    pub fn merge_retry(&mut self, indices: &[usize], retried: JoinedResult) {
        for (&index, mut result) in indices.iter().zip(retried.results) {
            if let Some(slot) = self.results.get_mut(index) {
                result.attempts += slot.attempts;
                *slot = result;
            }
        }
        if retried.stale {
            self.stale = true;
            self.observed_generation = retried.observed_generation;
        }
        self.refresh_failures();
    }

    pub(crate) fn discard_stale(&mut self, observed_generation: u64) {
        let note = format!(
            "discarded: pipeline moved from generation {} to {}",
            self.generation, observed_generation
        );
        for result in &mut self.results {
            result.discard(note.clone());
        }
        self.stale = true;
        self.observed_generation = observed_generation;
        self.refresh_failures();
    }

    /// Error for callers that cannot use a stale batch.
    pub fn stale_error(&self) -> PipelineError {
        PipelineError::ConcurrentModification {
            expected: self.generation,
            found: self.observed_generation,
        }
    }

    fn refresh_failures(&mut self) {
        self.partial_failures = self
            .results
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.worker_id.clone())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerStatus;
    use std::time::Duration;

    fn batch() -> JoinedResult {
        JoinedResult::new(
            vec![
                WorkerResult::succeeded("a", "one"),
                WorkerResult::failed("b", "crashed"),
                WorkerResult::succeeded("c", "three"),
                WorkerResult::timed_out("d", Duration::from_secs(1)),
            ],
            7,
        )
    }

    #[test]
    fn test_partial_failures_are_collected() {
        let joined = batch();
        assert_eq!(joined.partial_failures, vec!["b", "d"]);
        assert_eq!(joined.success_count(), 2);
        assert_eq!(joined.failed_indices(), vec![1, 3]);
        assert!(!joined.all_succeeded());
        assert_eq!(joined.outputs(), vec![("a", "one"), ("c", "three")]);
    }

    #[test]
    fn test_require_all_reports_failures() {
        let err = batch().require_all().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FanOutPartialFailure { total: 4, .. }
        ));
    }

    #[test]
    fn test_merge_retry_replaces_slots_and_counts_attempts() {
        let mut joined = batch();
        let retried = JoinedResult::new(
            vec![
                WorkerResult::succeeded("b", "two"),
                WorkerResult::failed("d", "still down"),
            ],
            7,
        );
        joined.merge_retry(&[1, 3], retried);
        assert_eq!(joined.partial_failures, vec!["d"]);
        assert_eq!(joined.results[1].output.as_deref(), Some("two"));
        assert_eq!(joined.results[1].attempts, 2);
        assert_eq!(joined.results[3].attempts, 2);
    }

    #[test]
    fn test_discard_stale_marks_every_result() {
        let mut joined = batch();
        joined.discard_stale(9);
        assert!(joined.stale);
        assert!(joined
            .results
            .iter()
            .all(|r| r.status == WorkerStatus::Discarded));
        assert!(joined.partial_failures.is_empty());
        assert_eq!(joined.success_count(), 0);
        assert!(matches!(
            joined.stale_error(),
            PipelineError::ConcurrentModification {
                expected: 7,
                found: 9
            }
        ));
    }
}
