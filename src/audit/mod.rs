//! Archive of finished tasks and escalation reports.

pub mod logger;

pub use logger::ArchiveLogger;

use crate::phase::Phase;
use crate::state::PipelineState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A terminal `PipelineState` with the moment it was archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedTask {
    pub task_id: Uuid,
    pub final_phase: Phase,
    pub attempt_count: u32,
    pub archived_at: DateTime<Utc>,
    pub state: PipelineState,
}

impl ArchivedTask {
    pub fn new(state: &PipelineState) -> Self {
        Self {
            task_id: state.task_id(),
            final_phase: state.phase(),
            attempt_count: state.attempt_count(),
            archived_at: Utc::now(),
            state: state.clone(),
        }
    }
}
