//! The fixed review checklist and verdict types.
//!
//! ## Example
//!
//! ```
//! use phasegate::review::{Criterion, Verdict};
//!
//! assert_eq!(Criterion::CHECKLIST.len(), 16);
//! assert_eq!(Criterion::NoRegressions.title(), "no regressions");
//! assert_eq!(Criterion::from_id("no regressions"), Some(Criterion::NoRegressions));
//! assert_eq!("n/a".parse::<Verdict>().unwrap(), Verdict::NotApplicable);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One criterion of the review checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    ProblemSolved,
    Idiomatic,
    NoPlaceholders,
    PlanFullyExecuted,
    ScopeAppropriate,
    NoScopeCreep,
    DependencyConsistency,
    JustifiedSolution,
    NoRegressions,
    NaturalIntegration,
    AppropriateSimplicity,
    Verifiable,
    ErrorHandling,
    SecurityConsidered,
    /// Only applies when the work touches documented behavior.
    DocsConsistent,
    /// Only applies when the work introduces configurable values.
    NoHardcodedConfig,
}

impl Criterion {
    /// The checklist, in evaluation order.
    pub const CHECKLIST: [Criterion; 16] = [
        Criterion::ProblemSolved,
        Criterion::Idiomatic,
        Criterion::NoPlaceholders,
        Criterion::PlanFullyExecuted,
        Criterion::ScopeAppropriate,
        Criterion::NoScopeCreep,
        Criterion::DependencyConsistency,
        Criterion::JustifiedSolution,
        Criterion::NoRegressions,
        Criterion::NaturalIntegration,
        Criterion::AppropriateSimplicity,
        Criterion::Verifiable,
        Criterion::ErrorHandling,
        Criterion::SecurityConsidered,
        Criterion::DocsConsistent,
        Criterion::NoHardcodedConfig,
    ];

    /// Stable identifier used in configuration, worker tags and reports.
    pub fn id(&self) -> &'static str {
        match self {
            Criterion::ProblemSolved => "problem_solved",
            Criterion::Idiomatic => "idiomatic",
            Criterion::NoPlaceholders => "no_placeholders",
            Criterion::PlanFullyExecuted => "plan_fully_executed",
            Criterion::ScopeAppropriate => "scope_appropriate",
            Criterion::NoScopeCreep => "no_scope_creep",
            Criterion::DependencyConsistency => "dependency_consistency",
            Criterion::JustifiedSolution => "justified_solution",
            Criterion::NoRegressions => "no_regressions",
            Criterion::NaturalIntegration => "natural_integration",
            Criterion::AppropriateSimplicity => "appropriate_simplicity",
            Criterion::Verifiable => "verifiable",
            Criterion::ErrorHandling => "error_handling",
            Criterion::SecurityConsidered => "security_considered",
            Criterion::DocsConsistent => "docs_consistent",
            Criterion::NoHardcodedConfig => "no_hardcoded_config",
        }
    }

    /// Human-readable title.
    pub fn title(&self) -> &'static str {
        match self {
            Criterion::ProblemSolved => "problem solved",
            Criterion::Idiomatic => "idiomatic",
            Criterion::NoPlaceholders => "no placeholders",
            Criterion::PlanFullyExecuted => "plan fully executed",
            Criterion::ScopeAppropriate => "scope appropriate",
            Criterion::NoScopeCreep => "no scope creep",
            Criterion::DependencyConsistency => "dependency consistency",
            Criterion::JustifiedSolution => "justified solution",
            Criterion::NoRegressions => "no regressions",
            Criterion::NaturalIntegration => "natural integration",
            Criterion::AppropriateSimplicity => "appropriate simplicity",
            Criterion::Verifiable => "verifiable",
            Criterion::ErrorHandling => "error handling",
            Criterion::SecurityConsidered => "security considered",
            Criterion::DocsConsistent => "docs consistent",
            Criterion::NoHardcodedConfig => "no hardcoded config",
        }
    }

    /// Criteria that may legitimately come back N/A.
    pub fn is_conditional(&self) -> bool {
        matches!(self, Criterion::DocsConsistent | Criterion::NoHardcodedConfig)
    }

    /// Tag a review worker carries to own this criterion.
    pub fn worker_tag(&self) -> String {
        format!("criterion:{}", self.id())
    }

    /// Look up a criterion by id or title, ignoring case.
    pub fn from_id(s: &str) -> Option<Criterion> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Criterion::CHECKLIST
            .into_iter()
            .find(|c| c.id() == wanted)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Criterion::from_id(s).ok_or_else(|| format!("unknown review criterion '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
            Verdict::NotApplicable => write!(f, "n/a"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" | "ok" => Ok(Verdict::Pass),
            "fail" | "failed" => Ok(Verdict::Fail),
            "n/a" | "na" | "not_applicable" | "skip" => Ok(Verdict::NotApplicable),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub criterion: Criterion,
    pub verdict: Verdict,
    pub evidence: String,
}

impl ReviewVerdict {
    pub fn new(criterion: Criterion, verdict: Verdict, evidence: impl Into<String>) -> Self {
        Self {
            criterion,
            verdict,
            evidence: evidence.into(),
        }
    }

    pub fn pass(criterion: Criterion, evidence: impl Into<String>) -> Self {
        Self::new(criterion, Verdict::Pass, evidence)
    }

    pub fn fail(criterion: Criterion, evidence: impl Into<String>) -> Self {
        Self::new(criterion, Verdict::Fail, evidence)
    }

    pub fn not_applicable(criterion: Criterion, evidence: impl Into<String>) -> Self {
        Self::new(criterion, Verdict::NotApplicable, evidence)
    }
}

/// Fold several opinions on one criterion: any fail wins, then any pass, else N/A.
///
/// N/A only stands for conditional criteria. An unconditional criterion that
/// nobody evaluated, or that every evaluator marked N/A, fails.
pub fn merge_verdicts(criterion: Criterion, opinions: &[ReviewVerdict]) -> ReviewVerdict {
    let pick = |verdict: Verdict| {
        let evidence: Vec<&str> = opinions
            .iter()
            .filter(|o| o.verdict == verdict)
            .map(|o| o.evidence.as_str())
            .filter(|e| !e.is_empty())
            .collect();
        ReviewVerdict::new(criterion, verdict, evidence.join("; "))
    };
    if opinions.iter().any(|o| o.verdict == Verdict::Fail) {
        pick(Verdict::Fail)
    } else if opinions.iter().any(|o| o.verdict == Verdict::Pass) {
        pick(Verdict::Pass)
    } else if opinions.is_empty() {
        if criterion.is_conditional() {
            ReviewVerdict::not_applicable(criterion, "no evaluator")
        } else {
            ReviewVerdict::fail(criterion, "not evaluated")
        }
    } else if criterion.is_conditional() {
        pick(Verdict::NotApplicable)
    } else {
        ReviewVerdict::fail(criterion, "marked n/a but always applies")
    }
}
