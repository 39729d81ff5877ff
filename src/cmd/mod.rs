//! CLI command implementations.
//!
//! Every command returns the process exit code.
//!
//! | Module    | Commands handled              |
//! |-----------|-------------------------------|
//! | `project` | `Init`, `Workers`             |
//! | `run`     | `Run`                         |
//! | `state`   | `Status`, `Inspect`, `Reset`  |
//! | `check`   | `Check`                       |
//! | `config`  | `Config`                      |

pub mod check;
pub mod config;
pub mod project;
pub mod run;
pub mod state;

pub use check::cmd_check;
pub use config::cmd_config;
pub use project::{cmd_init, cmd_workers};
pub use run::cmd_run;
pub use state::{cmd_inspect, cmd_reset, cmd_status};

use anyhow::{Result, bail};
use std::path::Path;

fn require_initialized(project_dir: &Path) -> Result<()> {
    if !phasegate::init::is_initialized(project_dir) {
        bail!("Project not initialized. Run 'phasegate init' first.");
    }
    Ok(())
}
