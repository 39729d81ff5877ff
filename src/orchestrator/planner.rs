//! Turns refined task input into an ordered execution plan.
//!
//! Refined input is either a goal document
//!
//! ```json
//! {"goals": [
//!   {"id": "schema", "class": "execute", "requires": ["sql"], "input": "add table"},
//!   {"id": "api", "depends_on": ["schema"], "input": "expose endpoint"}
//! ]}
//! ```
//!
//! or plain text, which becomes a single goal. Goals are layered into waves
//! with Kahn's algorithm: a wave with several goals runs as one parallel step.

use crate::errors::PipelineError;
use crate::worker::{CapabilityClass, InvocationMode, WorkerEntry, WorkerRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

fn default_goal_class() -> CapabilityClass {
    CapabilityClass::Execute
}

/// One independently executable piece of the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGoal {
    pub id: String,
    #[serde(default = "default_goal_class")]
    pub class: CapabilityClass,
    /// Capability tags the executing worker must carry.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub input: String,
}

impl SubGoal {
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: default_goal_class(),
            requires: Vec::new(),
            depends_on: Vec::new(),
            input: input.into(),
        }
    }

    pub fn requiring(mut self, tags: &[&str]) -> Self {
        self.requires = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GoalDocument {
    Wrapped { goals: Vec<SubGoal> },
    Bare(Vec<SubGoal>),
}

/// A goal bound to the worker that will run it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub goal: SubGoal,
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub assignments: Vec<Assignment>,
    pub mode: InvocationMode,
}

impl PlanStep {
    pub fn workers(&self) -> Vec<&str> {
        self.assignments.iter().map(|a| a.worker_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn goal_count(&self) -> usize {
        self.steps.iter().map(|s| s.assignments.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct Planner {
    registry: Arc<WorkerRegistry>,
}

impl Planner {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    /// Parse refined input into goals. Anything that is not a goal document is one goal.
    pub fn parse_goals(refined_input: &str) -> Vec<SubGoal> {
        let trimmed = refined_input.trim();
        match serde_json::from_str::<GoalDocument>(trimmed) {
            Ok(GoalDocument::Wrapped { goals } | GoalDocument::Bare(goals)) if !goals.is_empty() => {
                goals
            }
            _ => vec![SubGoal::new("goal-1", trimmed)],
        }
    }

    pub fn plan(&self, refined_input: &str) -> Result<ExecutionPlan, PipelineError> {
        self.plan_goals(Self::parse_goals(refined_input))
    }

    pub fn plan_goals(&self, goals: Vec<SubGoal>) -> Result<ExecutionPlan, PipelineError> {
        let waves = layer_waves(&goals)?;
        let mut by_id: HashMap<String, SubGoal> =
            goals.into_iter().map(|g| (g.id.clone(), g)).collect();

        let mut steps = Vec::with_capacity(waves.len());
        for wave in waves {
            let mut assignments = Vec::with_capacity(wave.len());
            for id in wave {
                let Some(goal) = by_id.remove(&id) else {
                    continue;
                };
                if !matches!(goal.class, CapabilityClass::Execute | CapabilityClass::Utility) {
                    return Err(PipelineError::Planning(format!(
                        "goal '{}' has class {}; only execute and utility goals can be planned",
                        goal.id, goal.class
                    )));
                }
                let worker = self.select_worker(goal.class, &goal.requires).ok_or_else(|| {
                    PipelineError::Planning(format!(
                        "no {} worker covers tags [{}] required by goal '{}'",
                        goal.class,
                        goal.requires.join(", "),
                        goal.id
                    ))
                })?;
                debug!(goal = %goal.id, worker = %worker.id, "assigned goal");
                assignments.push(Assignment {
                    worker_id: worker.id.clone(),
                    goal,
                });
            }
            let mode = if assignments.len() > 1 {
                InvocationMode::Parallel
            } else {
                InvocationMode::Single
            };
            steps.push(PlanStep { assignments, mode });
        }
        Ok(ExecutionPlan { steps })
    }

    /// Pick the narrowest qualifying worker: fewest tags, then lowest cost tier, then id.
    pub fn select_worker(
        &self,
        class: CapabilityClass,
        requires: &[String],
    ) -> Option<&WorkerEntry> {
        self.registry
            .candidates(class, requires)
            .into_iter()
            .min_by(|a, b| {
                a.capability_tags
                    .len()
                    .cmp(&b.capability_tags.len())
                    .then(a.cost_tier.cmp(&b.cost_tier))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}

/// Layer goals into dependency waves, preserving declaration order within a wave.
fn layer_waves(goals: &[SubGoal]) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut seen = HashSet::new();
    for goal in goals {
        if goal.id.trim().is_empty() {
            return Err(PipelineError::Planning("goal id must not be empty".into()));
        }
        if !seen.insert(goal.id.as_str()) {
            return Err(PipelineError::Planning(format!(
                "duplicate goal id '{}'",
                goal.id
            )));
        }
    }
    for goal in goals {
        for dep in &goal.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PipelineError::Planning(format!(
                    "goal '{}' depends on unknown goal '{}'",
                    goal.id, dep
                )));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = goals
        .iter()
        .map(|g| (g.id.as_str(), g.depends_on.len()))
        .collect();
    let mut waves = Vec::new();
    let mut placed = 0;

    while placed < goals.len() {
        let ready: Vec<&str> = goals
            .iter()
            .map(|g| g.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        if ready.is_empty() {
            let mut cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .collect();
            cyclic.sort_unstable();
            return Err(PipelineError::Planning(format!(
                "dependency cycle among goals: {}",
                cyclic.join(", ")
            )));
        }
        for id in &ready {
            in_degree.remove(id);
        }
        for goal in goals {
            let satisfied = goal
                .depends_on
                .iter()
                .filter(|dep| ready.contains(&dep.as_str()))
                .count();
            if let Some(deg) = in_degree.get_mut(goal.id.as_str()) {
                *deg -= satisfied;
            }
        }
        placed += ready.len();
        waves.push(ready.into_iter().map(String::from).collect());
    }
    Ok(waves)
}
