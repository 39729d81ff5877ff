//! State status, inspection, and reset commands.

use anyhow::Result;
use console::style;
use phasegate::config::{ConfigOverrides, PipelineConfig};
use phasegate::errors::exit_codes;
use phasegate::phase::Phase;
use phasegate::state::StateStore;
use std::path::Path;

pub fn cmd_status(project_dir: &Path) -> Result<i32> {
    println!();
    println!("phasegate Status");
    println!("================");
    println!();

    if !phasegate::init::is_initialized(project_dir) {
        println!("Project: Not initialized");
        println!();
        println!("Run 'phasegate init' to initialize the project.");
        println!();
        return Ok(exit_codes::SUCCESS);
    }

    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let state = StateStore::new(&config.state_dir).load_or_recover()?;

    let phase = match state.phase() {
        Phase::Complete => style(state.phase().to_string()).green().bold(),
        Phase::Blocked => style(state.phase().to_string()).red().bold(),
        other => style(other.to_string()).cyan().bold(),
    };
    println!("Phase:    {phase}");
    println!("Task:     {}", state.task_id());
    println!(
        "Attempts: {} of {}",
        state.attempt_count(),
        config.max_attempts()
    );
    if !state.active_workers().is_empty() {
        println!("Workers:  {}", state.active_workers().join(", "));
    }
    if let Some(last) = state.last_transition() {
        println!(
            "Last:     {} -> {} at {} ({})",
            last.from_phase,
            last.to_phase,
            last.timestamp.format("%Y-%m-%d %H:%M:%S"),
            last.reason
        );
    }
    println!();

    if state.phase() == Phase::Blocked {
        println!("Task is blocked. See .phasegate/escalations/ and run `phasegate reset`.");
        println!();
        return Ok(exit_codes::BLOCKED);
    }
    Ok(exit_codes::SUCCESS)
}

pub fn cmd_inspect(project_dir: &Path, json: bool) -> Result<i32> {
    super::require_initialized(project_dir)?;
    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let state = StateStore::new(&config.state_dir).load_or_recover()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(exit_codes::SUCCESS);
    }

    println!();
    println!("Task:       {}", state.task_id());
    println!("Phase:      {}", state.phase());
    println!("Attempts:   {}", state.attempt_count());
    println!("Generation: {}", state.generation());
    println!("Created:    {}", state.created_at().format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:    {}", state.updated_at().format("%Y-%m-%d %H:%M:%S"));
    println!();

    if state.history().is_empty() {
        println!("No transitions recorded.");
        println!();
        return Ok(exit_codes::SUCCESS);
    }

    println!("{:<20} {:<24} {:<16} Reason", "Timestamp", "Transition", "Worker");
    println!(
        "{:<20} {:<24} {:<16} ------",
        "--------------------", "------------------------", "----------------"
    );
    for record in state.history() {
        println!(
            "{:<20} {:<24} {:<16} {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{} -> {}", record.from_phase, record.to_phase),
            record.triggering_worker.as_deref().unwrap_or("-"),
            record.reason
        );
        if let Some(tried) = &record.attempt_summary {
            println!("    tried: {tried}");
        }
        for evidence in &record.evidence {
            println!(
                "    {} {}: {}",
                style("✗").red(),
                evidence.criterion,
                evidence.evidence
            );
        }
    }
    println!();
    Ok(exit_codes::SUCCESS)
}

pub fn cmd_reset(project_dir: &Path, force: bool, reason: &str) -> Result<i32> {
    use dialoguer::Confirm;

    super::require_initialized(project_dir)?;
    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let store = StateStore::new(&config.state_dir);

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will abandon the current task and return to IDLE. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(exit_codes::SUCCESS);
        }
    }

    let state = store.reset(reason)?;
    println!(
        "Pipeline reset to {} (generation {})",
        state.phase(),
        state.generation()
    );
    Ok(exit_codes::SUCCESS)
}
