//! Worker execution seam.
//!
//! `WorkerRuntime` is the only place a worker actually runs. The pipeline never
//! interprets worker behavior; it hands over a request and receives text.
//! `CommandRuntime` runs the shell command a registry entry declares:
//! - the serialized `WorkerInvocationRequest` is written to stdin
//! - stdout (trimmed) is the worker output
//! - a non-zero exit status is a worker failure carrying stderr

use super::registry::WorkerRegistry;
use super::types::WorkerInvocationRequest;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Run the worker named in `request` and return its output.
    async fn invoke(&self, request: &WorkerInvocationRequest) -> Result<String>;
}

/// Runs registry-declared shell commands.
pub struct CommandRuntime {
    registry: Arc<WorkerRegistry>,
    working_dir: PathBuf,
}

impl CommandRuntime {
    pub fn new(registry: Arc<WorkerRegistry>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            registry,
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl WorkerRuntime for CommandRuntime {
    async fn invoke(&self, request: &WorkerInvocationRequest) -> Result<String> {
        let entry = self
            .registry
            .get(&request.worker_id)
            .ok_or_else(|| anyhow!("worker '{}' is not registered", request.worker_id))?;
        let command = entry
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("worker '{}' declares no command", entry.id))?;

        let payload =
            serde_json::to_string(request).context("Failed to serialize worker request")?;

        debug!(worker = %entry.id, class = %request.capability_class, command, "spawning worker");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PHASEGATE_WORKER_ID", &request.worker_id)
            .env("PHASEGATE_CLASS", request.capability_class.as_str())
            .env("PHASEGATE_MODE", request.mode.to_string())
            .spawn()
            .with_context(|| format!("Failed to spawn worker command: {command}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Workers that ignore stdin may exit before the write lands.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e).context("Failed to write request to worker stdin");
            }
        }

        let output = match entry.timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs), child.wait_with_output()).await
            {
                Ok(result) => result.context("Failed to wait for worker command")?,
                Err(_) => bail!("worker '{}' timed out after {}s", entry.id, secs),
            },
            None => child
                .wait_with_output()
                .await
                .context("Failed to wait for worker command")?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "worker '{}' exited with code {}: {}",
                entry.id,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
