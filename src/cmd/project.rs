//! Project initialization and registry listing.

use anyhow::Result;
use phasegate::errors::exit_codes;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<i32> {
    use phasegate::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized phasegate project at {}",
            result.state_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .phasegate/");
        println!("  ├── pipeline.toml   # Configuration");
        println!("  ├── workers.toml    # Worker registry");
        println!("  ├── archive/        # Archived tasks");
        println!("  ├── escalations/    # Escalation reports");
        println!("  └── logs/           # Log files");
        println!();
        println!("Next steps:");
        println!("  1. Register your workers in .phasegate/workers.toml");
        println!("  2. Run `phasegate run --task \"...\"`");
    } else {
        println!(
            "phasegate project already initialized at {}",
            result.state_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(exit_codes::SUCCESS)
}

pub fn cmd_workers(project_dir: &Path) -> Result<i32> {
    use phasegate::config::{ConfigOverrides, PipelineConfig};
    use phasegate::worker::WorkerRegistry;

    super::require_initialized(project_dir)?;
    let config = PipelineConfig::load(project_dir, &ConfigOverrides::default())?;
    let registry = WorkerRegistry::load(&config.registry_file())?;

    if registry.is_empty() {
        println!("No workers registered in {}", config.registry_file().display());
        return Ok(exit_codes::SUCCESS);
    }

    println!();
    println!(
        "{:<24} {:<9} {:<7} {:<8} Tags",
        "Worker", "Class", "Cost", "Timeout"
    );
    println!(
        "{:<24} {:<9} {:<7} {:<8} ----",
        "------------------------", "---------", "-------", "--------"
    );
    for worker in registry.workers() {
        let timeout = worker
            .timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<9} {:<7} {:<8} {}",
            worker.id,
            worker.class,
            worker.cost_tier,
            timeout,
            worker.capability_tags.join(", ")
        );
    }
    println!();

    let missing = registry.missing_required_classes();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|c| c.as_str()).collect();
        println!(
            "{} no workers for required class(es): {}",
            console::style("Warning:").yellow(),
            names.join(", ")
        );
    }
    Ok(exit_codes::SUCCESS)
}
