//! Orchestration: planning sub-goals, executing plans, and driving a task
//! through every phase.

pub mod executor;
pub mod pipeline;
pub mod planner;

pub use executor::{
    ExecutionResult, PlanExecutor, RetryPolicy, StepOutcome, dispatch_with_retry,
};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use planner::{Assignment, ExecutionPlan, PlanStep, Planner, SubGoal};
