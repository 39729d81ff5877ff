//! Durable pipeline state.
//!
//! `PipelineState` is the only shared mutable resource in the pipeline. It is
//! persisted as pretty JSON in `.phasegate/state.json` and changed only through
//! [`StateStore::commit`] and [`StateStore::reset`].

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{
    AttemptChange, FailureEvidence, PipelineState, SCHEMA_VERSION, Transition, TransitionRecord,
};
