//! Review gate: evaluates an execution against the checklist.
//!
//! Two criteria are checked in-process. The rest fan out to review-class
//! workers under the `REVIEWING` phase, each reviewer answering
//!
//! ```json
//! {"verdicts": [{"criterion": "no_regressions", "verdict": "fail", "evidence": "2 tests red"}]}
//! ```

use super::checklist::{Criterion, ReviewVerdict, Verdict, merge_verdicts};
use crate::errors::PipelineError;
use crate::fanout::FanOutCoordinator;
use crate::orchestrator::{ExecutionPlan, ExecutionResult};
use crate::state::{FailureEvidence, PipelineState};
use crate::worker::{
    CapabilityClass, InvocationMode, WorkerInvocationRequest, WorkerRegistry, WorkerResult,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:TODO|FIXME|XXX|TBD)\b|\b(?:unimplemented|todo)!\(|(?i:lorem ipsum)|(?i:<placeholder>)|(?i:\[placeholder\])",
    )
    .expect("placeholder pattern is valid")
});

/// Criteria evaluated in-process.
const BUILTIN: [Criterion; 2] = [Criterion::PlanFullyExecuted, Criterion::NoPlaceholders];

/// Merged verdicts for the whole checklist, in checklist order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub verdicts: Vec<ReviewVerdict>,
}

impl ReviewSummary {
    /// Merge raw opinions into one verdict per checklist criterion.
    pub fn new(opinions: Vec<ReviewVerdict>) -> Self {
        let mut by_criterion: HashMap<Criterion, Vec<ReviewVerdict>> = HashMap::new();
        for opinion in opinions {
            by_criterion.entry(opinion.criterion).or_default().push(opinion);
        }
        let verdicts = Criterion::CHECKLIST
            .into_iter()
            .map(|c| merge_verdicts(c, by_criterion.get(&c).map(Vec::as_slice).unwrap_or(&[])))
            .collect();
        Self { verdicts }
    }

    /// No criterion failed. Unconditional criteria are never N/A after merging.
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.verdict != Verdict::Fail)
    }

    pub fn failures(&self) -> Vec<&ReviewVerdict> {
        self.verdicts
            .iter()
            .filter(|v| v.verdict == Verdict::Fail)
            .collect()
    }

    pub fn failed_criteria(&self) -> Vec<Criterion> {
        self.failures().into_iter().map(|v| v.criterion).collect()
    }

    pub fn evidence(&self) -> Vec<FailureEvidence> {
        self.failures()
            .into_iter()
            .map(|v| FailureEvidence::new(v.criterion.id(), v.evidence.clone()))
            .collect()
    }

    pub fn verdict(&self, criterion: Criterion) -> Option<&ReviewVerdict> {
        self.verdicts.iter().find(|v| v.criterion == criterion)
    }

    pub fn ensure_passed(&self) -> Result<(), PipelineError> {
        if self.passed() {
            return Ok(());
        }
        Err(PipelineError::ReviewFailure {
            failed_criteria: self
                .failed_criteria()
                .iter()
                .map(|c| c.title().to_string())
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReviewerReport {
    verdicts: Vec<RawVerdict>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    criterion: String,
    verdict: String,
    #[serde(default)]
    evidence: String,
}

pub struct ReviewGate {
    coordinator: Arc<FanOutCoordinator>,
    registry: Arc<WorkerRegistry>,
    delegates: HashMap<Criterion, String>,
}

impl ReviewGate {
    pub fn new(coordinator: Arc<FanOutCoordinator>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            coordinator,
            registry,
            delegates: HashMap::new(),
        }
    }

    /// Route criteria to specific review workers, overriding tag-based routing.
    pub fn with_delegates(mut self, delegates: HashMap<Criterion, String>) -> Self {
        self.delegates = delegates;
        self
    }

    pub async fn review(
        &self,
        snapshot: &PipelineState,
        plan: &ExecutionPlan,
        execution: &ExecutionResult,
    ) -> Result<ReviewSummary, PipelineError> {
        let mut opinions = builtin_verdicts(execution);

        let assignments = self.assignments();
        if !assignments.is_empty() {
            let mode = if assignments.len() > 1 {
                InvocationMode::Parallel
            } else {
                InvocationMode::Single
            };
            let requests = assignments
                .iter()
                .map(|(worker, criteria)| {
                    let input = reviewer_input(criteria, plan, execution);
                    WorkerInvocationRequest::new(worker, CapabilityClass::Review, input)
                        .with_mode(mode)
                })
                .collect();

            let joined = self.coordinator.dispatch(snapshot, requests).await?;
            if joined.stale {
                return Err(joined.stale_error());
            }
            for ((_, criteria), result) in assignments.iter().zip(&joined.results) {
                opinions.extend(reviewer_verdicts(result, criteria));
            }
        } else {
            warn!("no review workers registered; delegated criteria are not evaluated");
        }

        let summary = ReviewSummary::new(opinions);
        info!(
            passed = summary.passed(),
            failed = ?summary.failed_criteria().iter().map(Criterion::id).collect::<Vec<_>>(),
            "review complete"
        );
        Ok(summary)
    }

    /// Map each review worker to the criteria it evaluates, in registry order.
    pub fn assignments(&self) -> Vec<(String, Vec<Criterion>)> {
        let reviewers = self.registry.by_class(CapabilityClass::Review);
        let generalists: Vec<&str> = reviewers
            .iter()
            .filter(|w| !w.capability_tags.iter().any(|t| t.starts_with("criterion:")))
            .map(|w| w.id.as_str())
            .collect();

        let mut by_worker: HashMap<&str, Vec<Criterion>> = HashMap::new();
        for criterion in Criterion::CHECKLIST
            .into_iter()
            .filter(|c| !BUILTIN.contains(c))
        {
            let delegate = self.delegates.get(&criterion).and_then(|id| {
                let found = reviewers.iter().find(|w| &w.id == id).map(|w| w.id.as_str());
                if found.is_none() {
                    warn!(criterion = criterion.id(), worker = %id, "delegate is not a registered review worker");
                }
                found
            });
            let tag = criterion.worker_tag();
            let owner = delegate.or_else(|| {
                reviewers
                    .iter()
                    .filter(|w| w.has_tag(&tag))
                    .min_by(|a, b| {
                        a.capability_tags
                            .len()
                            .cmp(&b.capability_tags.len())
                            .then(a.cost_tier.cmp(&b.cost_tier))
                            .then_with(|| a.id.cmp(&b.id))
                    })
                    .map(|w| w.id.as_str())
            });
            match owner {
                Some(worker) => by_worker.entry(worker).or_default().push(criterion),
                None => {
                    for worker in &generalists {
                        by_worker.entry(*worker).or_default().push(criterion);
                    }
                }
            }
        }

        reviewers
            .iter()
            .filter_map(|w| {
                by_worker
                    .remove(w.id.as_str())
                    .map(|criteria| (w.id.clone(), criteria))
            })
            .collect()
    }
}

fn builtin_verdicts(execution: &ExecutionResult) -> Vec<ReviewVerdict> {
    let plan_verdict = if execution.is_complete() {
        ReviewVerdict::pass(Criterion::PlanFullyExecuted, execution.summary())
    } else {
        ReviewVerdict::fail(Criterion::PlanFullyExecuted, execution.summary())
    };

    let outputs = execution.outputs();
    let placeholder_verdict = if outputs.is_empty() {
        ReviewVerdict::pass(Criterion::NoPlaceholders, "no output to scan")
    } else {
        let hits: Vec<String> = outputs
            .iter()
            .filter_map(|(worker, output)| {
                PLACEHOLDER_REGEX
                    .find(output)
                    .map(|m| format!("'{}' in output of {worker}", m.as_str()))
            })
            .collect();
        if hits.is_empty() {
            ReviewVerdict::pass(Criterion::NoPlaceholders, "no placeholder markers found")
        } else {
            ReviewVerdict::fail(Criterion::NoPlaceholders, hits.join("; "))
        }
    };
    vec![plan_verdict, placeholder_verdict]
}

fn reviewer_input(
    criteria: &[Criterion],
    plan: &ExecutionPlan,
    execution: &ExecutionResult,
) -> String {
    let criteria: Vec<_> = criteria
        .iter()
        .map(|c| json!({"id": c.id(), "title": c.title(), "conditional": c.is_conditional()}))
        .collect();
    let outputs: Vec<_> = execution
        .outputs()
        .into_iter()
        .map(|(worker, output)| json!({"worker": worker, "output": output}))
        .collect();
    json!({
        "criteria": criteria,
        "plan": plan,
        "execution": {
            "summary": execution.summary(),
            "aborted": execution.aborted,
            "outputs": outputs,
        },
    })
    .to_string()
}

/// Turn one reviewer's result into verdicts on its assigned criteria.
fn reviewer_verdicts(result: &WorkerResult, assigned: &[Criterion]) -> Vec<ReviewVerdict> {
    let fail_all = |evidence: String| -> Vec<ReviewVerdict> {
        assigned
            .iter()
            .map(|c| ReviewVerdict::fail(*c, evidence.clone()))
            .collect()
    };

    if !result.is_success() {
        return fail_all(format!(
            "reviewer {} did not report: {}",
            result.worker_id,
            result.summary()
        ));
    }
    let output = result.output.as_deref().unwrap_or_default();
    let report: ReviewerReport = match serde_json::from_str(output) {
        Ok(report) => report,
        Err(e) => {
            warn!(worker = %result.worker_id, error = %e, "unparseable reviewer output");
            return fail_all(format!(
                "reviewer {} returned unparseable output: {e}",
                result.worker_id
            ));
        }
    };

    report
        .verdicts
        .into_iter()
        .filter_map(|raw| {
            let criterion = Criterion::from_id(&raw.criterion)?;
            if !assigned.contains(&criterion) {
                debug!(worker = %result.worker_id, criterion = criterion.id(), "ignoring unassigned verdict");
                return None;
            }
            Some(match raw.verdict.parse::<Verdict>() {
                Ok(verdict) => ReviewVerdict::new(criterion, verdict, raw.evidence),
                Err(e) => ReviewVerdict::fail(criterion, format!("{}: {e}", result.worker_id)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::fanout::FanOutConfig;
    use crate::orchestrator::executor::StepOutcome;
    use crate::phase::Phase;
    use crate::state::{StateStore, Transition, TransitionRecord};
    use crate::worker::WorkerEntry;
    use crate::worker::runtime::testing::ScriptedRuntime;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        gate: ReviewGate,
    }

    fn harness(reviewers: Vec<WorkerEntry>, runtime: ScriptedRuntime) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let registry = Arc::new(WorkerRegistry::from_entries(reviewers).unwrap());
        let coordinator = Arc::new(FanOutCoordinator::new(
            Arc::new(AdmissionGate::default()),
            Arc::new(runtime),
            store.clone(),
            FanOutConfig::default(),
        ));
        Harness {
            _dir: dir,
            store,
            gate: ReviewGate::new(coordinator, registry),
        }
    }

    fn reviewing(store: &StateStore) -> PipelineState {
        let mut state = store.load().unwrap();
        let mut from = Phase::Idle;
        while from != Phase::Reviewing {
            let to = from.next().unwrap();
            state = store
                .commit(&state, Transition::new(TransitionRecord::new(from, to, "test")))
                .unwrap();
            from = to;
        }
        state
    }

    fn execution(output: &str) -> ExecutionResult {
        ExecutionResult {
            planned_steps: 1,
            steps: vec![StepOutcome {
                index: 0,
                goal_ids: vec!["goal-1".into()],
                results: vec![WorkerResult::succeeded("builder", output)],
            }],
            aborted: None,
        }
    }

    fn report(verdicts: &[(&str, &str, &str)]) -> String {
        let verdicts: Vec<_> = verdicts
            .iter()
            .map(|(c, v, e)| json!({"criterion": c, "verdict": v, "evidence": e}))
            .collect();
        json!({ "verdicts": verdicts }).to_string()
    }

    fn reviewer(id: &str) -> WorkerEntry {
        WorkerEntry::new(id, CapabilityClass::Review)
    }

    /// A report passing every delegated criterion except the given overrides.
    fn passing_except(overrides: &[(&str, &str, &str)]) -> String {
        let verdicts: Vec<(&str, &str, &str)> = Criterion::CHECKLIST
            .iter()
            .filter(|c| !BUILTIN.contains(*c))
            .map(|c| {
                overrides
                    .iter()
                    .find(|(id, _, _)| *id == c.id())
                    .copied()
                    .unwrap_or((c.id(), "pass", "ok"))
            })
            .collect();
        report(&verdicts)
    }

    async fn review_with(reviewers: Vec<WorkerEntry>, runtime: ScriptedRuntime) -> ReviewSummary {
        let h = harness(reviewers, runtime);
        let state = reviewing(&h.store);
        h.gate
            .review(&state, &ExecutionPlan::default(), &execution("done"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_pass_from_generalist() {
        let h = harness(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply("generalist", &passing_except(&[])),
        );
        let state = reviewing(&h.store);
        let summary = h
            .gate
            .review(&state, &ExecutionPlan::default(), &execution("shipped"))
            .await
            .unwrap();
        assert!(summary.passed());
        assert_eq!(summary.verdicts.len(), 16);
        assert!(summary.ensure_passed().is_ok());
    }

    #[tokio::test]
    async fn test_single_failed_criterion_is_isolated() {
        let summary = review_with(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply(
                "generalist",
                &passing_except(&[("no_regressions", "fail", "integration suite red")]),
            ),
        )
        .await;
        assert_eq!(summary.failed_criteria(), vec![Criterion::NoRegressions]);
        assert_eq!(
            summary.verdict(Criterion::NoRegressions).unwrap().evidence,
            "integration suite red"
        );
        let err = summary.ensure_passed().unwrap_err();
        assert_eq!(err.to_string(), "Review failed on: no regressions");
    }

    #[tokio::test]
    async fn test_unreported_criteria_fail_as_not_evaluated() {
        let summary = review_with(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply(
                "generalist",
                &report(&[
                    ("problem_solved", "pass", ""),
                    ("no_regressions", "pass", ""),
                ]),
            ),
        )
        .await;
        assert!(!summary.passed());
        let verifiable = summary.verdict(Criterion::Verifiable).unwrap();
        assert_eq!(verifiable.verdict, Verdict::Fail);
        assert_eq!(verifiable.evidence, "not evaluated");
        assert!(!summary.failed_criteria().contains(&Criterion::ProblemSolved));
        // Conditional criteria without a verdict stay N/A.
        assert_eq!(
            summary.verdict(Criterion::DocsConsistent).unwrap().verdict,
            Verdict::NotApplicable
        );
    }

    #[tokio::test]
    async fn test_empty_report_fails_review() {
        let summary = review_with(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply("generalist", &report(&[])),
        )
        .await;
        assert!(!summary.passed());
        assert!(summary.failed_criteria().contains(&Criterion::ProblemSolved));
        assert!(summary.failed_criteria().contains(&Criterion::ErrorHandling));
        assert!(!summary.failed_criteria().contains(&Criterion::PlanFullyExecuted));
    }

    #[tokio::test]
    async fn test_na_on_docs_passes_but_na_on_problem_solved_fails() {
        let summary = review_with(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply(
                "generalist",
                &passing_except(&[
                    ("docs_consistent", "n/a", "no docs touched"),
                    ("no_hardcoded_config", "n/a", ""),
                ]),
            ),
        )
        .await;
        assert!(summary.passed());
        assert_eq!(
            summary.verdict(Criterion::DocsConsistent).unwrap().verdict,
            Verdict::NotApplicable
        );

        let summary = review_with(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply(
                "generalist",
                &passing_except(&[("problem_solved", "n/a", "")]),
            ),
        )
        .await;
        assert_eq!(summary.failed_criteria(), vec![Criterion::ProblemSolved]);
    }

    #[tokio::test]
    async fn test_no_reviewer_registered_fails_review() {
        let summary = review_with(vec![], ScriptedRuntime::new()).await;
        assert!(!summary.passed());
        assert_eq!(
            summary.verdict(Criterion::ProblemSolved).unwrap().evidence,
            "not evaluated"
        );
        assert_eq!(
            summary.verdict(Criterion::PlanFullyExecuted).unwrap().verdict,
            Verdict::Pass
        );
    }

    #[test]
    fn test_summary_merges_duplicate_and_missing_criteria() {
        let summary = ReviewSummary::new(vec![
            ReviewVerdict::pass(Criterion::Idiomatic, "fine"),
            ReviewVerdict::fail(Criterion::Idiomatic, "index loops"),
        ]);
        assert_eq!(summary.verdicts.len(), 16);
        assert_eq!(summary.verdict(Criterion::Idiomatic).unwrap().evidence, "index loops");
        assert!(summary.failed_criteria().contains(&Criterion::ErrorHandling));
    }

    #[tokio::test]
    async fn test_placeholders_fail_builtin_check() {
        let h = harness(vec![], ScriptedRuntime::new());
        let state = reviewing(&h.store);
        let summary = h
            .gate
            .review(
                &state,
                &ExecutionPlan::default(),
                &execution("fn main() { todo!() }"),
            )
            .await
            .unwrap();
        let verdict = summary.verdict(Criterion::NoPlaceholders).unwrap();
        assert_eq!(verdict.verdict, Verdict::Fail);
        assert!(verdict.evidence.contains("todo!("));
    }

    #[tokio::test]
    async fn test_aborted_execution_fails_plan_check() {
        let h = harness(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply("generalist", &passing_except(&[])),
        );
        let state = reviewing(&h.store);
        let mut aborted = execution("partial");
        aborted.planned_steps = 2;
        aborted.aborted = Some("step 2 failed after retry: builder".into());
        let summary = h
            .gate
            .review(&state, &ExecutionPlan::default(), &aborted)
            .await
            .unwrap();
        assert_eq!(summary.failed_criteria(), vec![Criterion::PlanFullyExecuted]);
    }

    #[tokio::test]
    async fn test_failed_reviewer_fails_its_criteria() {
        let summary = review_with(
            vec![
                reviewer("generalist"),
                reviewer("security").with_tags(["criterion:security_considered"]),
            ],
            ScriptedRuntime::new()
                .reply("generalist", &passing_except(&[]))
                .fail("security", "scanner crashed"),
        )
        .await;
        assert_eq!(summary.failed_criteria(), vec![Criterion::SecurityConsidered]);
        assert!(summary
            .verdict(Criterion::SecurityConsidered)
            .unwrap()
            .evidence
            .contains("scanner crashed"));
    }

    #[tokio::test]
    async fn test_unparseable_output_fails_assigned_criteria() {
        let summary = review_with(
            vec![
                reviewer("generalist"),
                reviewer("docs").with_tags(["criterion:docs_consistent"]),
            ],
            ScriptedRuntime::new()
                .reply("generalist", &passing_except(&[]))
                .reply("docs", "looks good to me"),
        )
        .await;
        assert_eq!(summary.failed_criteria(), vec![Criterion::DocsConsistent]);
        assert!(summary
            .verdict(Criterion::DocsConsistent)
            .unwrap()
            .evidence
            .contains("unparseable"));
    }

    #[test]
    fn test_assignments_route_tagged_and_delegated_criteria() {
        let h = harness(
            vec![
                reviewer("generalist"),
                reviewer("security").with_tags(["criterion:security_considered"]),
                reviewer("tester"),
            ],
            ScriptedRuntime::new(),
        );
        let gate = h.gate.with_delegates(HashMap::from([(
            Criterion::NoRegressions,
            "tester".to_string(),
        )]));
        let assignments: HashMap<String, Vec<Criterion>> =
            gate.assignments().into_iter().collect();

        assert_eq!(assignments["security"], vec![Criterion::SecurityConsidered]);
        assert!(assignments["tester"].contains(&Criterion::NoRegressions));
        assert!(!assignments["generalist"].contains(&Criterion::SecurityConsidered));
        assert!(!assignments["generalist"].contains(&Criterion::NoRegressions));
        assert!(!assignments["generalist"].contains(&Criterion::PlanFullyExecuted));
        assert!(assignments["generalist"].contains(&Criterion::Idiomatic));
    }

    #[tokio::test]
    async fn test_review_denied_outside_reviewing() {
        let h = harness(
            vec![reviewer("generalist")],
            ScriptedRuntime::new().reply("generalist", &report(&[])),
        );
        let idle = h.store.load().unwrap();
        let err = h
            .gate
            .review(&idle, &ExecutionPlan::default(), &execution("done"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PhaseViolation { .. }));
    }
}
