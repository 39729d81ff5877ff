//! `phasegate run`: drive a task through the pipeline.

use anyhow::{Context, Result};
use console::style;
use phasegate::audit::ArchiveLogger;
use phasegate::config::{ConfigOverrides, PipelineConfig};
use phasegate::orchestrator::{Pipeline, PipelineOutcome};
use phasegate::worker::{CommandRuntime, WorkerRegistry, WorkerRuntime};
use std::path::Path;
use std::sync::Arc;

pub async fn cmd_run(project_dir: &Path, task: &str, overrides: &ConfigOverrides) -> Result<i32> {
    super::require_initialized(project_dir)?;

    let config = PipelineConfig::load(project_dir, overrides)?;
    config.validate()?;
    let registry = Arc::new(
        WorkerRegistry::load(&config.registry_file()).context("Failed to load worker registry")?,
    );
    let runtime: Arc<dyn WorkerRuntime> =
        Arc::new(CommandRuntime::new(registry.clone(), project_dir));
    let pipeline = Pipeline::from_config(&config, registry, runtime)?;

    println!(
        "{} {} (max attempts {})",
        style("Running task:").bold(),
        task,
        config.max_attempts()
    );

    let outcome = pipeline.run(task).await?;
    match &outcome {
        PipelineOutcome::Complete { state, execution } => {
            println!();
            println!(
                "{} task {} after {} remediation attempt(s)",
                style("COMPLETE").green().bold(),
                state.task_id(),
                state.attempt_count()
            );
            println!("  {}", execution.summary());
        }
        PipelineOutcome::Blocked { state, report } => {
            println!();
            print!("{}", report.render());
            let path = ArchiveLogger::new(&config.state_dir)
                .escalation_path(&state.task_id().to_string());
            println!("  Report:   {}", path.display());
            println!();
            println!("Run `phasegate reset` once the task has been handled.");
        }
    }

    Ok(outcome.exit_code())
}
