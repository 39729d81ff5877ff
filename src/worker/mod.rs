//! Workers: typed requests and results, the read-only registry, and the
//! runtime seam that executes them.

pub mod registry;
pub mod runtime;
pub mod types;

pub use registry::{CostTier, WorkerEntry, WorkerRegistry};
pub use runtime::{CommandRuntime, WorkerRuntime};
pub use types::{
    CapabilityClass, InvocationMode, WorkerInvocationRequest, WorkerResult, WorkerStatus,
};
