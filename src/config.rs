//! Pipeline configuration read from `.phasegate/pipeline.toml`.
//!
//! Settings are layered file → environment → CLI. Every key is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_attempts = 3
//!
//! [fanout]
//! max_width = 8
//! join_timeout_secs = 300
//! accept_partial = true
//!
//! [retry]
//! local_retries = 1
//! backoff_ms = 250
//!
//! [admission]
//! utility_classes = ["utility"]
//!
//! [admission.phases.EXECUTING]
//! classes = ["execute"]
//! parallel = true
//!
//! [review.delegate]
//! security_considered = "security-reviewer"
//!
//! [logging]
//! level = "warn"
//! json = false
//! file = true
//! ```

use crate::admission::{AdmissionTable, PhaseRule};
use crate::errors::PipelineError;
use crate::fanout::FanOutConfig;
use crate::init::{LOGS_DIR, STATE_DIR, WORKERS_FILE};
use crate::orchestrator::RetryPolicy;
use crate::review::Criterion;
use crate::worker::CapabilityClass;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "pipeline.toml";

pub const ENV_MAX_ATTEMPTS: &str = "PHASEGATE_MAX_ATTEMPTS";
pub const ENV_JOIN_TIMEOUT_SECS: &str = "PHASEGATE_JOIN_TIMEOUT_SECS";
pub const ENV_MAX_WIDTH: &str = "PHASEGATE_MAX_WIDTH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Review failures tolerated before the task is blocked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutSection {
    #[serde(default = "default_max_width")]
    pub max_width: usize,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Accept a gather batch where some (but not all) workers failed.
    #[serde(default = "default_accept_partial")]
    pub accept_partial: bool,
}

fn default_max_width() -> usize {
    8
}

fn default_join_timeout_secs() -> u64 {
    300
}

fn default_accept_partial() -> bool {
    true
}

impl Default for FanOutSection {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            join_timeout_secs: default_join_timeout_secs(),
            accept_partial: default_accept_partial(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Re-runs of a failed worker with identical input.
    #[serde(default = "default_local_retries")]
    pub local_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_local_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    250
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            local_retries: default_local_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSection {
    /// Classes admitted in every non-terminal phase.
    #[serde(default = "default_utility_classes")]
    pub utility_classes: Vec<CapabilityClass>,
    /// Per-phase rules replacing the defaults, keyed by phase name.
    #[serde(default)]
    pub phases: HashMap<String, PhaseRule>,
}

fn default_utility_classes() -> Vec<CapabilityClass> {
    vec![CapabilityClass::Utility]
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            utility_classes: default_utility_classes(),
            phases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Criterion id to the review worker that evaluates it.
    #[serde(default)]
    pub delegate: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Console level when neither `-v` nor `RUST_LOG` is given.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write JSON logs to `.phasegate/logs`.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: default_log_file(),
        }
    }
}

/// The complete pipeline.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub fanout: FanOutSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PipelineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    /// Load `pipeline.toml` from the state directory, or defaults if it is absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Problems that would make the pipeline misbehave. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.pipeline.max_attempts == 0 {
            problems.push("pipeline.max_attempts must be at least 1".to_string());
        }
        if self.fanout.max_width == 0 {
            problems.push("fanout.max_width must be at least 1".to_string());
        }
        if self.fanout.join_timeout_secs == 0 {
            problems.push("fanout.join_timeout_secs must be at least 1".to_string());
        }
        if let Err(e) = self.admission_table() {
            problems.push(e.to_string());
        }
        if let Err(e) = self.review_delegates() {
            problems.push(e.to_string());
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            problems.push(format!(
                "Invalid logging.level '{}'. Valid values: error, warn, info, debug, trace",
                self.logging.level
            ));
        }

        problems
    }

    pub fn admission_table(&self) -> Result<AdmissionTable, PipelineError> {
        AdmissionTable::with_overrides(
            self.admission.utility_classes.clone(),
            &self.admission.phases,
        )
    }

    pub fn review_delegates(&self) -> Result<HashMap<Criterion, String>, PipelineError> {
        self.review
            .delegate
            .iter()
            .map(|(id, worker)| {
                let criterion = Criterion::from_id(id).ok_or_else(|| {
                    PipelineError::Config(format!("unknown review criterion '{id}' in [review.delegate]"))
                })?;
                Ok((criterion, worker.clone()))
            })
            .collect()
    }
}

/// Values given on the command line. `None` defers to env and file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_attempts: Option<u32>,
    pub join_timeout_secs: Option<u64>,
    pub max_width: Option<usize>,
}

/// Resolved configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: PipelineToml,
}

impl PipelineConfig {
    pub fn load(project_dir: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        Self::load_with_env(project_dir, overrides, |key| std::env::var(key).ok())
    }

    /// Like [`PipelineConfig::load`], reading the environment through `env`.
    pub fn load_with_env<F>(project_dir: &Path, overrides: &ConfigOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = PipelineToml::load_or_default(&state_dir)?;

        if let Some(value) = env_value(&env, ENV_MAX_ATTEMPTS)? {
            toml.pipeline.max_attempts = value;
        }
        if let Some(value) = env_value(&env, ENV_JOIN_TIMEOUT_SECS)? {
            toml.fanout.join_timeout_secs = value;
        }
        if let Some(value) = env_value(&env, ENV_MAX_WIDTH)? {
            toml.fanout.max_width = value;
        }

        if let Some(value) = overrides.max_attempts {
            toml.pipeline.max_attempts = value;
        }
        if let Some(value) = overrides.join_timeout_secs {
            toml.fanout.join_timeout_secs = value;
        }
        if let Some(value) = overrides.max_width {
            toml.fanout.max_width = value;
        }

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            state_dir,
            toml,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.toml.pipeline.max_attempts
    }

    pub fn accept_partial(&self) -> bool {
        self.toml.fanout.accept_partial
    }

    pub fn fanout(&self) -> FanOutConfig {
        FanOutConfig::default()
            .with_max_width(self.toml.fanout.max_width)
            .with_join_timeout(Duration::from_secs(self.toml.fanout.join_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.toml.retry.local_retries,
            Duration::from_millis(self.toml.retry.backoff_ms),
        )
    }

    pub fn registry_file(&self) -> PathBuf {
        self.state_dir.join(WORKERS_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join(LOGS_DIR)
    }

    /// Validate the resolved values, including env and CLI overrides.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let problems = self.toml.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(problems.join("; ")))
        }
    }
}

fn env_value<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match env(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("{key} must be a number, got '{raw}'")).into()),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(project: &Path, content: &str) {
        let state_dir = project.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join(CONFIG_FILE), content).unwrap();
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let config =
            PipelineConfig::load_with_env(dir.path(), &ConfigOverrides::default(), no_env).unwrap();
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.fanout().max_width, 8);
        assert_eq!(config.fanout().join_timeout, Duration::from_secs(300));
        assert!(config.accept_partial());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = PipelineToml::parse(
            r#"
[pipeline]
max_attempts = 5

[fanout]
max_width = 2
join_timeout_secs = 10
accept_partial = false

[retry]
local_retries = 0

[admission.phases.executing]
classes = ["execute"]
parallel = false

[review.delegate]
security_considered = "sec"
"#,
        )
        .unwrap();
        assert_eq!(toml.pipeline.max_attempts, 5);
        assert!(!toml.fanout.accept_partial);
        assert_eq!(toml.retry.local_retries, 0);
        assert_eq!(toml.retry.backoff_ms, 250);

        let table = toml.admission_table().unwrap();
        let rule = table.rule(Phase::Executing).unwrap();
        assert_eq!(rule.classes, vec![CapabilityClass::Execute]);
        assert!(!rule.parallel);

        let delegates = toml.review_delegates().unwrap();
        assert_eq!(delegates[&Criterion::SecurityConsidered], "sec");
    }

    #[test]
    fn test_layering_file_then_env_then_cli() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[pipeline]\nmax_attempts = 5\n[fanout]\nmax_width = 4\n");

        let env = |key: &str| match key {
            ENV_MAX_ATTEMPTS => Some("7".to_string()),
            ENV_JOIN_TIMEOUT_SECS => Some("30".to_string()),
            _ => None,
        };
        let overrides = ConfigOverrides {
            max_attempts: Some(2),
            ..Default::default()
        };
        let config = PipelineConfig::load_with_env(dir.path(), &overrides, env).unwrap();
        assert_eq!(config.max_attempts(), 2);
        assert_eq!(config.fanout().join_timeout, Duration::from_secs(30));
        assert_eq!(config.fanout().max_width, 4);
    }

    #[test]
    fn test_non_numeric_env_is_rejected() {
        let dir = tempdir().unwrap();
        let env = |key: &str| (key == ENV_MAX_WIDTH).then(|| "wide".to_string());
        let err =
            PipelineConfig::load_with_env(dir.path(), &ConfigOverrides::default(), env).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_WIDTH));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let toml = PipelineToml::parse(
            r#"
[pipeline]
max_attempts = 0

[admission.phases.complete]
classes = ["gather"]

[review.delegate]
made_up = "x"

[logging]
level = "loud"
"#,
        )
        .unwrap();
        let problems = toml.validate();
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("max_attempts")));
        assert!(problems.iter().any(|p| p.contains("terminal phase")));
        assert!(problems.iter().any(|p| p.contains("made_up")));
        assert!(problems.iter().any(|p| p.contains("loud")));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = PipelineToml::default();
        toml.fanout.max_width = 3;
        toml.save(&path).unwrap();
        assert_eq!(PipelineToml::load(&path).unwrap().fanout.max_width, 3);
    }
}
