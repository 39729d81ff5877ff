//! Pipeline phases and the transition edge table.
//!
//! The pipeline is a closed state machine:
//!
//! ```text
//! IDLE -> GATHERING -> REFINING -> PLANNING -> EXECUTING -> REVIEWING -> COMPLETE
//!             ^                                                 |
//!             +------------------ remediation ------------------+
//!
//! any non-terminal phase -> BLOCKED
//! ```
//!
//! `COMPLETE` and `BLOCKED` are terminal: only an explicit reset leaves them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Gathering,
    Refining,
    Planning,
    Executing,
    Reviewing,
    Complete,
    Blocked,
}

impl Phase {
    /// Every phase in pipeline order.
    pub const ALL: [Phase; 8] = [
        Phase::Idle,
        Phase::Gathering,
        Phase::Refining,
        Phase::Planning,
        Phase::Executing,
        Phase::Reviewing,
        Phase::Complete,
        Phase::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Gathering => "GATHERING",
            Phase::Refining => "REFINING",
            Phase::Planning => "PLANNING",
            Phase::Executing => "EXECUTING",
            Phase::Reviewing => "REVIEWING",
            Phase::Complete => "COMPLETE",
            Phase::Blocked => "BLOCKED",
        }
    }

    /// Terminal phases accept no further transitions except a reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Blocked)
    }

    /// The phase reached on success, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Gathering),
            Phase::Gathering => Some(Phase::Refining),
            Phase::Refining => Some(Phase::Planning),
            Phase::Planning => Some(Phase::Executing),
            Phase::Executing => Some(Phase::Reviewing),
            Phase::Reviewing => Some(Phase::Complete),
            Phase::Complete | Phase::Blocked => None,
        }
    }

    /// Phases reachable from this one through a single committed transition.
    pub fn allowed_transitions(&self) -> Vec<Phase> {
        match self {
            Phase::Idle => vec![Phase::Gathering, Phase::Blocked],
            Phase::Gathering => vec![Phase::Refining, Phase::Blocked],
            Phase::Refining => vec![Phase::Planning, Phase::Blocked],
            Phase::Planning => vec![Phase::Executing, Phase::Blocked],
            Phase::Executing => vec![Phase::Reviewing, Phase::Blocked],
            Phase::Reviewing => vec![Phase::Complete, Phase::Gathering, Phase::Blocked],
            Phase::Complete | Phase::Blocked => vec![],
        }
    }

    pub fn can_transition_to(&self, to: Phase) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain_reaches_complete() {
        let mut phase = Phase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next), "{phase} -> {next}");
            phase = next;
            visited.push(phase);
        }
        assert_eq!(phase, Phase::Complete);
        assert_eq!(visited.len(), 7);
    }

    #[test]
    fn test_remediation_edge_only_from_reviewing() {
        assert!(Phase::Reviewing.can_transition_to(Phase::Gathering));
        for phase in Phase::ALL {
            if phase != Phase::Reviewing && phase != Phase::Idle {
                assert!(!phase.can_transition_to(Phase::Gathering), "{phase}");
            }
        }
    }

    #[test]
    fn test_every_non_terminal_phase_can_block() {
        for phase in Phase::ALL.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Blocked), "{phase}");
        }
    }

    #[test]
    fn test_terminal_phases_have_no_edges() {
        assert!(Phase::Complete.allowed_transitions().is_empty());
        assert!(Phase::Blocked.allowed_transitions().is_empty());
        assert!(Phase::Complete.next().is_none());
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        assert!(!Phase::Idle.can_transition_to(Phase::Executing));
        assert!(!Phase::Gathering.can_transition_to(Phase::Reviewing));
        assert!(!Phase::Refining.can_transition_to(Phase::Gathering));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("gathering".parse::<Phase>().unwrap(), Phase::Gathering);
        assert_eq!("BLOCKED".parse::<Phase>().unwrap(), Phase::Blocked);
        assert!("SHIPPING".parse::<Phase>().is_err());
        assert_eq!(Phase::Reviewing.to_string(), "REVIEWING");
    }

    #[test]
    fn test_serde_uses_upper_case_names() {
        let json = serde_json::to_string(&Phase::Executing).unwrap();
        assert_eq!(json, "\"EXECUTING\"");
        let phase: Phase = serde_json::from_str("\"IDLE\"").unwrap();
        assert_eq!(phase, Phase::Idle);
        assert!(serde_json::from_str::<Phase>("\"LAUNCHING\"").is_err());
    }
}
