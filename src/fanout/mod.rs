//! Fan-out coordinator: bounded parallel dispatch with a single join deadline.
//!
//! A batch is admitted as a whole, run as independent tokio tasks under a
//! semaphore of `max_width` permits, and joined into a [`JoinedResult`].
//! Cancellation is by generation: results that arrive after the pipeline moved
//! on are discarded, and tasks are never killed.

pub mod coordinator;
pub mod result;

pub use coordinator::{FanOutConfig, FanOutCoordinator};
pub use result::JoinedResult;
