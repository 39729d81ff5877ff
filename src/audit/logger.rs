use super::ArchivedTask;
use crate::remediation::EscalationReport;
use crate::state::PipelineState;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ARCHIVE_DIR: &str = "archive";
pub const ESCALATIONS_DIR: &str = "escalations";

pub struct ArchiveLogger {
    archive_dir: PathBuf,
    escalations_dir: PathBuf,
}

impl ArchiveLogger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            archive_dir: state_dir.join(ARCHIVE_DIR),
            escalations_dir: state_dir.join(ESCALATIONS_DIR),
        }
    }

    /// Write a terminal state to `archive/<timestamp>_<task8>.json`.
    pub fn archive(&self, state: &PipelineState) -> Result<PathBuf> {
        let record = ArchivedTask::new(state);
        let filename = format!(
            "{}_{}.json",
            record.archived_at.format("%Y-%m-%dT%H-%M-%S"),
            &record.task_id.to_string()[..8]
        );
        fs::create_dir_all(&self.archive_dir).context("Failed to create archive directory")?;
        let path = self.archive_dir.join(filename);
        let json =
            serde_json::to_string_pretty(&record).context("Failed to serialize archived task")?;
        fs::write(&path, json).context("Failed to write archive file")?;
        info!(task_id = %record.task_id, phase = %record.final_phase, path = %path.display(), "task archived");
        Ok(path)
    }

    /// Write an escalation report to `escalations/<task_id>.json`.
    pub fn write_escalation(&self, report: &EscalationReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.escalations_dir)
            .context("Failed to create escalations directory")?;
        let path = self.escalation_path(&report.task_id.to_string());
        let json = serde_json::to_string_pretty(report)
            .context("Failed to serialize escalation report")?;
        fs::write(&path, json).context("Failed to write escalation report")?;
        Ok(path)
    }

    pub fn escalation_path(&self, task_id: &str) -> PathBuf {
        self.escalations_dir.join(format!("{task_id}.json"))
    }

    pub fn load_escalation(&self, task_id: &str) -> Result<Option<EscalationReport>> {
        let path = self.escalation_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).context("Failed to read escalation report")?;
        let report =
            serde_json::from_str(&content).context("Failed to parse escalation report")?;
        Ok(Some(report))
    }

    /// Archive files, most recent first.
    pub fn list_archives(&self) -> Result<Vec<PathBuf>> {
        if !self.archive_dir.exists() {
            return Ok(Vec::new());
        }

        let mut archives: Vec<PathBuf> = fs::read_dir(&self.archive_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        archives.sort();
        archives.reverse();
        Ok(archives)
    }

    pub fn load_archive(&self, path: &Path) -> Result<ArchivedTask> {
        let content = fs::read_to_string(path).context("Failed to read archive file")?;
        let record = serde_json::from_str(&content).context("Failed to parse archive file")?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::state::{AttemptChange, Transition, TransitionRecord};
    use tempfile::TempDir;

    fn blocked_state() -> PipelineState {
        let mut state = PipelineState::fresh();
        state.apply(
            Transition::new(TransitionRecord::new(Phase::Idle, Phase::Gathering, "admit"))
                .with_attempt_change(AttemptChange::Reset),
        );
        state.apply(Transition::new(TransitionRecord::new(
            Phase::Gathering,
            Phase::Blocked,
            "every gather worker failed",
        )));
        state
    }

    #[test]
    fn test_archive_round_trips_terminal_state() {
        let dir = TempDir::new().unwrap();
        let logger = ArchiveLogger::new(dir.path());
        let state = blocked_state();

        let path = logger.archive(&state).unwrap();
        assert!(path.starts_with(dir.path().join(ARCHIVE_DIR)));
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .contains(&state.task_id().to_string()[..8])
        );

        let loaded = logger.load_archive(&path).unwrap();
        assert_eq!(loaded.final_phase, Phase::Blocked);
        assert_eq!(loaded.state.history().len(), 2);
        assert_eq!(logger.list_archives().unwrap(), vec![path]);
    }

    #[test]
    fn test_list_archives_without_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let logger = ArchiveLogger::new(dir.path());
        assert!(logger.list_archives().unwrap().is_empty());
    }

    #[test]
    fn test_escalation_written_under_task_id() {
        let dir = TempDir::new().unwrap();
        let logger = ArchiveLogger::new(dir.path());
        let state = blocked_state();
        let report = EscalationReport::from_state(&state, 3, "every gather worker failed");

        let path = logger.write_escalation(&report).unwrap();
        assert_eq!(
            path,
            dir.path()
                .join(ESCALATIONS_DIR)
                .join(format!("{}.json", state.task_id()))
        );
        let loaded = logger
            .load_escalation(&state.task_id().to_string())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.final_reason, "every gather worker failed");
        assert!(logger.load_escalation("missing").unwrap().is_none());
    }
}
