//! Review gate and the fixed review checklist.
//!
//! Every criterion gets its own verdict; a failure on one never masks the
//! others. The overall review passes only when every criterion that is not
//! N/A passes.

pub mod checklist;
pub mod gate;

pub use checklist::{Criterion, ReviewVerdict, Verdict, merge_verdicts};
pub use gate::{ReviewGate, ReviewSummary};
