//! Project initialization for phasegate.
//!
//! `phasegate init` creates the `.phasegate/` directory in a project:
//!
//! ```text
//! .phasegate/
//! ├── pipeline.toml    # Configuration
//! ├── workers.toml     # Worker registry (read-only to the pipeline)
//! ├── state.json       # Persisted pipeline state (created on first use)
//! ├── archive/         # Archived terminal states
//! ├── escalations/     # Escalation reports
//! └── logs/            # Rolling log files
//! ```

use crate::audit::logger::{ARCHIVE_DIR, ESCALATIONS_DIR};
use crate::config::CONFIG_FILE;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The name of the phasegate state directory.
pub const STATE_DIR: &str = ".phasegate";
pub const WORKERS_FILE: &str = "workers.toml";
pub const LOGS_DIR: &str = "logs";

const DEFAULT_PIPELINE_TOML: &str = r#"[pipeline]
max_attempts = 3

[fanout]
max_width = 8
join_timeout_secs = 300
accept_partial = true

[retry]
local_retries = 1
backoff_ms = 250

[admission]
utility_classes = ["utility"]

[logging]
level = "warn"
json = false
file = true
"#;

/// Workers receive the invocation request as JSON on stdin and answer on stdout.
///
/// The sample reviewer fails review until it is replaced with a real one.
const SAMPLE_WORKERS_TOML: &str = r#"[[workers]]
id = "scout"
class = "gather"
capability_tags = ["repo"]
cost_tier = "low"
command = "cat"

[[workers]]
id = "refiner"
class = "refine"
command = "cat"

[[workers]]
id = "builder"
class = "execute"
command = "echo done"
timeout_secs = 120

[[workers]]
id = "reviewer"
class = "review"
command = "echo '{\"verdicts\": [{\"criterion\": \"problem_solved\", \"verdict\": \"fail\", \"evidence\": \"sample reviewer: replace this command with a real review worker\"}]}'"
"#;

#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    /// False when the directory already existed.
    pub created: bool,
}

/// Initialize a phasegate project in `project_dir`.
///
/// Existing files are never overwritten; a partial layout is completed.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = project_dir.join(STATE_DIR);
    let created = !state_dir.exists();

    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create directory: {}", state_dir.display()))?;
    ensure_directory_structure(&state_dir)?;

    Ok(InitResult { state_dir, created })
}

fn ensure_directory_structure(state_dir: &Path) -> Result<()> {
    for name in [ARCHIVE_DIR, ESCALATIONS_DIR, LOGS_DIR] {
        let dir = state_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    write_if_missing(&state_dir.join(CONFIG_FILE), DEFAULT_PIPELINE_TOML)?;
    write_if_missing(&state_dir.join(WORKERS_FILE), SAMPLE_WORKERS_TOML)?;
    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if !path.exists() {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(STATE_DIR).exists()
}

pub fn get_state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR)
}
