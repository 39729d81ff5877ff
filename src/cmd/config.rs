//! Configuration view and validation: `phasegate config`.

use anyhow::Result;
use phasegate::admission::AdmissionGate;
use phasegate::config::{ConfigOverrides, PipelineConfig};
use phasegate::errors::exit_codes;
use phasegate::phase::Phase;
use phasegate::worker::WorkerRegistry;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<i32> {
    match command {
        None | Some(ConfigCommands::Show) => show(project_dir),
        Some(ConfigCommands::Validate) => validate(project_dir),
    }
}

fn show(project_dir: &Path) -> Result<i32> {
    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let toml = &config.toml;

    println!();
    println!("phasegate Configuration");
    println!("=======================");
    println!();

    if config.config_file().exists() {
        println!("Config file: {}", config.config_file().display());
    } else {
        println!("No pipeline.toml found at {}", config.config_file().display());
        println!("Using default configuration.");
    }
    println!();

    println!("Effective values (with env overrides):");
    println!("[pipeline]");
    println!("  max_attempts = {}", toml.pipeline.max_attempts);
    println!("[fanout]");
    println!("  max_width = {}", toml.fanout.max_width);
    println!("  join_timeout_secs = {}", toml.fanout.join_timeout_secs);
    println!("  accept_partial = {}", toml.fanout.accept_partial);
    println!("[retry]");
    println!("  local_retries = {}", toml.retry.local_retries);
    println!("  backoff_ms = {}", toml.retry.backoff_ms);
    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  json = {}", toml.logging.json);
    println!("  file = {}", toml.logging.file);
    if !toml.review.delegate.is_empty() {
        println!("[review.delegate]");
        let mut delegates: Vec<_> = toml.review.delegate.iter().collect();
        delegates.sort();
        for (criterion, worker) in delegates {
            println!("  {criterion} = \"{worker}\"");
        }
    }
    println!();

    // Malformed admission overrides are reported by `config validate`.
    if let Ok(table) = toml.admission_table() {
        let gate = AdmissionGate::new(table);
        println!("Admission table:");
        for phase in Phase::ALL {
            let classes: Vec<&str> = gate
                .permitted_classes(phase)
                .iter()
                .map(|c| c.as_str())
                .collect();
            let classes = if classes.is_empty() {
                "-".to_string()
            } else {
                classes.join(", ")
            };
            println!("  {:<10} {}", phase.as_str(), classes);
        }
        println!();
    }

    Ok(exit_codes::SUCCESS)
}

fn validate(project_dir: &Path) -> Result<i32> {
    println!();
    println!("Validating configuration...");
    println!();

    let mut problems = Vec::new();
    match PipelineConfig::load(project_dir, &ConfigOverrides::default()) {
        Ok(config) => {
            problems.extend(config.toml.validate());
            if config.registry_file().exists() {
                match WorkerRegistry::load(&config.registry_file()) {
                    Ok(registry) => {
                        for class in registry.missing_required_classes() {
                            problems.push(format!("no worker registered for class '{class}'"));
                        }
                    }
                    Err(e) => problems.push(e.to_string()),
                }
            } else {
                problems.push(format!(
                    "worker registry not found at {}",
                    config.registry_file().display()
                ));
            }
        }
        Err(e) => problems.push(format!("{e:#}")),
    }

    if problems.is_empty() {
        println!("Configuration is valid.");
        println!();
        return Ok(exit_codes::SUCCESS);
    }

    println!("Configuration problems:");
    for problem in &problems {
        println!("  - {problem}");
    }
    println!();
    Ok(exit_codes::ERROR)
}
