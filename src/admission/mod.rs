//! Admission gate: decides whether a worker request may run in the current phase.
//!
//! The gate is a pure, table-driven check. It never mutates state; the phase
//! controller commits the consequences of an admitted request.
//!
//! | Phase | Classes | Parallel |
//! |---|---|---|
//! | IDLE | gather | yes |
//! | GATHERING | gather | yes |
//! | REFINING | refine | no |
//! | PLANNING, EXECUTING | plan, execute | yes |
//! | REVIEWING | review | yes |
//! | COMPLETE, BLOCKED | none | - |
//!
//! Utility classes bypass the table in every phase.

use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::worker::{CapabilityClass, InvocationMode, WorkerInvocationRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    ClassNotPermitted {
        phase: Phase,
        class: CapabilityClass,
    },
    TerminalPhase {
        phase: Phase,
    },
    ParallelNotPermitted {
        phase: Phase,
    },
    SingleWorkerPhase {
        phase: Phase,
        requested: usize,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::ClassNotPermitted { phase, class } => {
                write!(f, "{class} workers are not permitted during {phase}")
            }
            DenialReason::TerminalPhase { phase } => {
                write!(f, "{phase} is terminal; reset the pipeline first")
            }
            DenialReason::ParallelNotPermitted { phase } => {
                write!(f, "{phase} runs a single worker; parallel mode is not permitted")
            }
            DenialReason::SingleWorkerPhase { phase, requested } => {
                write!(f, "{phase} runs a single worker, {requested} were requested")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(DenialReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn into_result(self, phase: Phase) -> Result<(), PipelineError> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied(reason) => Err(PipelineError::PhaseViolation { phase, reason }),
        }
    }
}

fn default_parallel() -> bool {
    true
}

/// Allow-list entry for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRule {
    pub classes: Vec<CapabilityClass>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl PhaseRule {
    pub fn new(classes: Vec<CapabilityClass>, parallel: bool) -> Self {
        Self { classes, parallel }
    }
}

/// Phase to permitted-class table.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionTable {
    rules: BTreeMap<Phase, PhaseRule>,
    utility_classes: Vec<CapabilityClass>,
}

impl Default for AdmissionTable {
    fn default() -> Self {
        use CapabilityClass::*;
        let rules = BTreeMap::from([
            (Phase::Idle, PhaseRule::new(vec![Gather], true)),
            (Phase::Gathering, PhaseRule::new(vec![Gather], true)),
            (Phase::Refining, PhaseRule::new(vec![Refine], false)),
            (Phase::Planning, PhaseRule::new(vec![Plan, Execute], true)),
            (Phase::Executing, PhaseRule::new(vec![Plan, Execute], true)),
            (Phase::Reviewing, PhaseRule::new(vec![Review], true)),
        ]);
        Self {
            rules,
            utility_classes: vec![Utility],
        }
    }
}

impl AdmissionTable {
    /// Build the default table with per-phase overrides keyed by phase name.
    pub fn with_overrides(
        utility_classes: Vec<CapabilityClass>,
        overrides: &HashMap<String, PhaseRule>,
    ) -> Result<Self, PipelineError> {
        let mut table = Self::default().with_utility_classes(utility_classes);
        for (name, rule) in overrides {
            let phase: Phase = name.parse().map_err(PipelineError::Config)?;
            if phase.is_terminal() {
                return Err(PipelineError::Config(format!(
                    "admission rules cannot be set for terminal phase {phase}"
                )));
            }
            table = table.with_rule(phase, rule.clone());
        }
        Ok(table)
    }

    pub fn with_rule(mut self, phase: Phase, rule: PhaseRule) -> Self {
        self.rules.insert(phase, rule);
        self
    }

    pub fn with_utility_classes(mut self, classes: Vec<CapabilityClass>) -> Self {
        self.utility_classes = classes;
        self
    }

    pub fn rule(&self, phase: Phase) -> Option<&PhaseRule> {
        if phase.is_terminal() {
            return None;
        }
        self.rules.get(&phase)
    }

    pub fn is_utility(&self, class: CapabilityClass) -> bool {
        self.utility_classes.contains(&class)
    }

    pub fn utility_classes(&self) -> &[CapabilityClass] {
        &self.utility_classes
    }
}

pub struct AdmissionGate {
    table: AdmissionTable,
}

impl AdmissionGate {
    pub fn new(table: AdmissionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &AdmissionTable {
        &self.table
    }

    pub fn check(&self, request: &WorkerInvocationRequest, phase: Phase) -> Admission {
        let class = request.capability_class;
        if self.table.is_utility(class) {
            return Admission::Allowed;
        }
        if phase.is_terminal() {
            return Admission::Denied(DenialReason::TerminalPhase { phase });
        }
        let Some(rule) = self.table.rule(phase) else {
            return Admission::Denied(DenialReason::ClassNotPermitted { phase, class });
        };
        if !rule.classes.contains(&class) {
            return Admission::Denied(DenialReason::ClassNotPermitted { phase, class });
        }
        if !rule.parallel && request.mode == InvocationMode::Parallel {
            return Admission::Denied(DenialReason::ParallelNotPermitted { phase });
        }
        Admission::Allowed
    }

    /// Check each request, then the single-worker rule for the batch as a whole.
    pub fn check_batch(&self, requests: &[WorkerInvocationRequest], phase: Phase) -> Admission {
        if let Some(denied) = requests
            .iter()
            .map(|r| self.check(r, phase))
            .find(|a| !a.is_allowed())
        {
            return denied;
        }
        let restricted = requests
            .iter()
            .filter(|r| !self.table.is_utility(r.capability_class))
            .count();
        if let Some(rule) = self.table.rule(phase)
            && !rule.parallel
            && restricted > 1
        {
            return Admission::Denied(DenialReason::SingleWorkerPhase {
                phase,
                requested: restricted,
            });
        }
        Admission::Allowed
    }

    /// Classes a request may carry in `phase`, utility classes included.
    pub fn permitted_classes(&self, phase: Phase) -> Vec<CapabilityClass> {
        let mut classes: Vec<CapabilityClass> = self
            .table
            .rule(phase)
            .map(|rule| rule.classes.clone())
            .unwrap_or_default();
        for utility in self.table.utility_classes() {
            if !classes.contains(utility) {
                classes.push(*utility);
            }
        }
        classes
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(AdmissionTable::default())
    }
}
