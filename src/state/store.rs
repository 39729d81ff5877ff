use super::types::{PipelineState, Transition};
use crate::errors::PipelineError;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = "state.lock";

/// Exclusive lock on the state directory, released on drop.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Durable, single-writer store for `PipelineState`.
///
/// Every read-modify-write runs under an exclusive file lock and checks the
/// stored generation against the caller's base snapshot, so concurrent
/// committers linearize and the loser gets `ConcurrentModification`.
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        Self {
            state_file: dir.join(STATE_FILE),
            lock_file: dir.join(LOCK_FILE),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Read the current state. A missing file yields a fresh `IDLE` state.
    pub fn load(&self) -> Result<PipelineState, PipelineError> {
        self.read()
    }

    /// Read the current state, replacing a corrupt file with a fresh `IDLE` state.
    ///
    /// The corrupt file is moved aside, never deleted. If it cannot be moved the
    /// corruption is unrecoverable and the error surfaces.
    pub fn load_or_recover(&self) -> Result<PipelineState, PipelineError> {
        match self.read() {
            Err(PipelineError::CorruptState { .. }) => {
                let _lock = self.lock()?;
                self.read_or_recover_locked()
            }
            other => other,
        }
    }

    /// Apply `transition` on top of `base`, failing if the store moved since `base` was read.
    pub fn commit(
        &self,
        base: &PipelineState,
        transition: Transition,
    ) -> Result<PipelineState, PipelineError> {
        let _lock = self.lock()?;
        let mut current = self.read()?;

        if current.generation() != base.generation() {
            warn!(
                expected = base.generation(),
                found = current.generation(),
                "commit rejected: state moved since snapshot"
            );
            return Err(PipelineError::ConcurrentModification {
                expected: base.generation(),
                found: current.generation(),
            });
        }

        let from = transition.record.from_phase;
        let to = transition.record.to_phase;
        if from != current.phase() || !current.phase().can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: current.phase(),
                to,
            });
        }

        current.apply(transition);
        self.write(&current)?;
        info!(
            from = %from,
            to = %to,
            generation = current.generation(),
            attempts = current.attempt_count(),
            "committed transition"
        );
        Ok(current)
    }

    /// Force the pipeline back to `IDLE`, keeping history.
    pub fn reset(&self, reason: &str) -> Result<PipelineState, PipelineError> {
        let _lock = self.lock()?;
        let mut state = self.read_or_recover_locked()?;
        let from = state.phase();
        state.reset_to_idle(reason);
        self.write(&state)?;
        info!(from = %from, generation = state.generation(), "pipeline reset to IDLE");
        Ok(state)
    }

    pub fn current_generation(&self) -> Result<u64, PipelineError> {
        Ok(self.read()?.generation())
    }

    fn lock(&self) -> Result<StoreLock, PipelineError> {
        if let Some(parent) = self.lock_file.parent() {
            fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .map_err(PipelineError::io(&self.lock_file))?;
        file.lock_exclusive()
            .map_err(PipelineError::io(&self.lock_file))?;
        Ok(StoreLock { file })
    }

    fn read(&self) -> Result<PipelineState, PipelineError> {
        if !self.state_file.exists() {
            return Ok(PipelineState::fresh());
        }
        let content =
            fs::read_to_string(&self.state_file).map_err(PipelineError::io(&self.state_file))?;
        let state: PipelineState =
            serde_json::from_str(&content).map_err(|e| self.corrupt(e.to_string()))?;
        state.validate().map_err(|message| self.corrupt(message))?;
        Ok(state)
    }

    /// Must be called with the lock held.
    fn read_or_recover_locked(&self) -> Result<PipelineState, PipelineError> {
        match self.read() {
            Err(PipelineError::CorruptState { path, message }) => {
                warn!(path = %path.display(), error = %message, "pipeline state is corrupt");
                let backup = self.quarantine().map_err(|e| PipelineError::CorruptState {
                    path: path.clone(),
                    message: format!("{message}; the corrupt file could not be preserved: {e}"),
                })?;
                warn!(
                    backup = %backup.display(),
                    "corrupt state preserved; starting from a fresh IDLE state"
                );
                let fresh = PipelineState::fresh();
                self.write(&fresh)?;
                Ok(fresh)
            }
            other => other,
        }
    }

    fn quarantine(&self) -> std::io::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup = self
            .state_file
            .with_file_name(format!("{STATE_FILE}.corrupt-{stamp}"));
        fs::rename(&self.state_file, &backup)?;
        Ok(backup)
    }

    fn write(&self, state: &PipelineState) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.state_file.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(PipelineError::io(&tmp))?;
            file.write_all(json.as_bytes())
                .map_err(PipelineError::io(&tmp))?;
            file.sync_all().map_err(PipelineError::io(&tmp))?;
        }
        fs::rename(&tmp, &self.state_file).map_err(PipelineError::io(&self.state_file))?;
        debug!(generation = state.generation(), "state persisted");
        Ok(())
    }

    fn corrupt(&self, message: String) -> PipelineError {
        PipelineError::CorruptState {
            path: self.state_file.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::state::types::{AttemptChange, TransitionRecord};
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        (dir, store)
    }

    fn admit() -> Transition {
        Transition::new(TransitionRecord::new(Phase::Idle, Phase::Gathering, "admitted"))
            .with_active_workers(vec!["scout".into()])
            .with_attempt_change(AttemptChange::Reset)
    }

    #[test]
    fn test_load_missing_is_fresh_idle() {
        let (_dir, store) = make_store();
        let state = store.load().unwrap();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.generation(), 0);
        assert!(!store.state_file().exists());
    }

    #[test]
    fn test_commit_then_load_round_trip() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        let committed = store.commit(&base, admit()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, committed);
        assert_eq!(loaded.phase(), Phase::Gathering);
        let last = loaded.last_transition().unwrap();
        assert_eq!(last.to_phase, Phase::Gathering);
        assert_eq!(last.reason, "admitted");
    }

    #[test]
    fn test_stale_base_is_rejected() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        store.commit(&base, admit()).unwrap();

        let err = store.commit(&base, admit()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ConcurrentModification {
                expected: 0,
                found: 1
            }
        ));
        assert_eq!(store.load().unwrap().history().len(), 1);
    }

    #[test]
    fn test_edge_outside_table_is_rejected() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        let skip = Transition::new(TransitionRecord::new(Phase::Idle, Phase::Executing, "skip"));
        assert!(matches!(
            store.commit(&base, skip),
            Err(PipelineError::InvalidTransition {
                from: Phase::Idle,
                to: Phase::Executing
            })
        ));
        assert_eq!(store.load().unwrap().generation(), 0);
    }

    #[test]
    fn test_record_from_wrong_phase_is_rejected() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        let wrong = Transition::new(TransitionRecord::new(
            Phase::Gathering,
            Phase::Refining,
            "wrong origin",
        ));
        assert!(store.commit(&base, wrong).is_err());
    }

    #[test]
    fn test_history_is_append_only() {
        let (_dir, store) = make_store();
        let mut state = store.load().unwrap();
        state = store.commit(&state, admit()).unwrap();
        let first = state.history().to_vec();
        state = store
            .commit(
                &state,
                Transition::new(TransitionRecord::new(
                    Phase::Gathering,
                    Phase::Refining,
                    "gathered",
                )),
            )
            .unwrap();
        assert_eq!(&state.history()[..1], first.as_slice());
        assert_eq!(state.history().len(), 2);
    }

    #[test]
    fn test_corrupt_json_fails_load() {
        let (_dir, store) = make_store();
        fs::write(store.state_file(), "{ not json").unwrap();
        assert!(matches!(
            store.load(),
            Err(PipelineError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_unknown_phase_fails_load() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        store.commit(&base, admit()).unwrap();
        let content = fs::read_to_string(store.state_file()).unwrap();
        fs::write(store.state_file(), content.replace("GATHERING", "LAUNCHING")).unwrap();
        assert!(matches!(
            store.load(),
            Err(PipelineError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_recover_preserves_corrupt_file() {
        let (dir, store) = make_store();
        fs::write(store.state_file(), "garbage").unwrap();

        let state = store.load_or_recover().unwrap();
        assert_eq!(state.phase(), Phase::Idle);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("state.json.corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        let preserved = fs::read_to_string(dir.path().join(&backups[0])).unwrap();
        assert_eq!(preserved, "garbage");
        assert!(store.load().is_ok());
    }

    #[test]
    fn test_reset_forces_idle_and_keeps_history() {
        let (_dir, store) = make_store();
        let base = store.load().unwrap();
        store.commit(&base, admit()).unwrap();

        let reset = store.reset("operator request").unwrap();
        assert_eq!(reset.phase(), Phase::Idle);
        assert_eq!(reset.history().len(), 2);
        assert_eq!(reset.generation(), 2);
        assert!(reset.active_workers().is_empty());
        assert_eq!(store.current_generation().unwrap(), 2);
    }

    #[test]
    fn test_reset_recovers_corrupt_state() {
        let (_dir, store) = make_store();
        fs::write(store.state_file(), "[]").unwrap();
        let state = store.reset("recover").unwrap();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_concurrent_commits_exactly_one_wins() {
        let (_dir, store) = make_store();
        let store = std::sync::Arc::new(store);
        let base = store.load().unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let base = base.clone();
                std::thread::spawn(move || store.commit(&base, admit()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(PipelineError::ConcurrentModification { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(store.load().unwrap().history().len(), 1);
    }
}
