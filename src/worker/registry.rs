//! Read-only worker registry loaded from `.phasegate/workers.toml`.
//!
//! ```toml
//! [[workers]]
//! id = "code-scout"
//! class = "gather"
//! capability_tags = ["rust", "search"]
//! cost_tier = "low"
//! command = "./workers/scout.sh"
//! timeout_secs = 120
//! ```
//!
//! The registry is an external catalog: the pipeline looks workers up but never
//! mutates the file.

use super::types::CapabilityClass;
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Relative cost of running a worker. Lower tiers win selection ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for CostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CostTier::Low => write!(f, "low"),
            CostTier::Medium => write!(f, "medium"),
            CostTier::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub id: String,
    pub class: CapabilityClass,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    #[serde(default)]
    pub cost_tier: CostTier,
    /// Shell command run by `CommandRuntime`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkerEntry {
    pub fn new(id: impl Into<String>, class: CapabilityClass) -> Self {
        Self {
            id: id.into(),
            class,
            capability_tags: Vec::new(),
            cost_tier: CostTier::default(),
            command: None,
            timeout_secs: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost_tier(mut self, tier: CostTier) -> Self {
        self.cost_tier = tier;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.capability_tags.iter().any(|t| t == tag)
    }

    /// True when every required tag is present.
    pub fn covers(&self, requires: &[String]) -> bool {
        requires.iter().all(|tag| self.has_tag(tag))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workers: Vec<WorkerEntry>,
}

/// Catalog of workers, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerEntry>,
}

impl WorkerRegistry {
    /// Load the registry from a TOML file. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| PipelineError::Registry(format!("failed to parse workers.toml: {e}")))?;
        Self::from_entries(file.workers)
    }

    pub fn from_entries(workers: Vec<WorkerEntry>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for worker in &workers {
            if worker.id.trim().is_empty() {
                return Err(PipelineError::Registry("worker id must not be empty".into()));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(PipelineError::Registry(format!(
                    "duplicate worker id '{}'",
                    worker.id
                )));
            }
        }
        Ok(Self { workers })
    }

    pub fn get(&self, id: &str) -> Option<&WorkerEntry> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn workers(&self) -> &[WorkerEntry] {
        &self.workers
    }

    pub fn by_class(&self, class: CapabilityClass) -> Vec<&WorkerEntry> {
        self.workers.iter().filter(|w| w.class == class).collect()
    }

    /// Workers of `class` whose tags cover every tag in `requires`.
    pub fn candidates(&self, class: CapabilityClass, requires: &[String]) -> Vec<&WorkerEntry> {
        self.workers
            .iter()
            .filter(|w| w.class == class && w.covers(requires))
            .collect()
    }

    /// Classes the pipeline cannot run without that have no registered worker.
    pub fn missing_required_classes(&self) -> Vec<CapabilityClass> {
        [
            CapabilityClass::Gather,
            CapabilityClass::Refine,
            CapabilityClass::Execute,
            CapabilityClass::Review,
        ]
        .into_iter()
        .filter(|class| self.by_class(*class).is_empty())
        .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[[workers]]
id = "scout"
class = "gather"
capability_tags = ["search"]
cost_tier = "low"
command = "echo scout"

[[workers]]
id = "rust-builder"
class = "execute"
capability_tags = ["rust", "cargo"]
cost_tier = "high"

[[workers]]
id = "refiner"
class = "refine"
"#;

    #[test]
    fn test_parse_registry() {
        let registry = WorkerRegistry::parse(SAMPLE).unwrap();
        assert_eq!(registry.len(), 3);

        let scout = registry.get("scout").unwrap();
        assert_eq!(scout.class, CapabilityClass::Gather);
        assert_eq!(scout.cost_tier, CostTier::Low);
        assert_eq!(scout.command.as_deref(), Some("echo scout"));

        let refiner = registry.get("refiner").unwrap();
        assert_eq!(refiner.cost_tier, CostTier::Medium);
        assert!(refiner.capability_tags.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let content = r#"
[[workers]]
id = "a"
class = "gather"

[[workers]]
id = "a"
class = "review"
"#;
        let err = WorkerRegistry::parse(content).unwrap_err();
        assert!(err.to_string().contains("duplicate worker id 'a'"));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let content = "[[workers]]\nid = \"a\"\nclass = \"deploy\"\n";
        assert!(matches!(
            WorkerRegistry::parse(content),
            Err(PipelineError::Registry(_))
        ));
    }

    #[test]
    fn test_candidates_filter_by_class_and_tags() {
        let registry = WorkerRegistry::parse(SAMPLE).unwrap();
        let rust = vec!["rust".to_string()];
        let found = registry.candidates(CapabilityClass::Execute, &rust);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "rust-builder");

        let go = vec!["go".to_string()];
        assert!(registry.candidates(CapabilityClass::Execute, &go).is_empty());
        assert!(registry.candidates(CapabilityClass::Gather, &rust).is_empty());
    }

    #[test]
    fn test_missing_required_classes() {
        let registry = WorkerRegistry::parse(SAMPLE).unwrap();
        assert!(registry.missing_required_classes().is_empty());

        let empty = WorkerRegistry::default();
        assert_eq!(empty.missing_required_classes().len(), 4);
        assert!(empty
            .missing_required_classes()
            .contains(&CapabilityClass::Review));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::load(&dir.path().join("workers.toml")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workers.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let registry = WorkerRegistry::load(&path).unwrap();
        assert_eq!(registry.by_class(CapabilityClass::Gather).len(), 1);
    }
}
