//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as an ordered list of checkpoints. A
//! checkpoint is either a single stage or a parallel group of independent
//! stages aggregated together.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cache::is_safe_component;
use super::inputs::InputSpec;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Cache TTL for stages without their own
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Per-stage timeout for stages without their own
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Ordered checkpoints
    pub steps: Vec<PipelineStep>,

    /// Directory declared input globs are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_ttl_seconds() -> u64 {
    86_400
} // 1 day
fn default_timeout_seconds() -> u64 {
    300
} // 5 min

impl Pipeline {
    /// Load a pipeline from a YAML file; inputs resolve next to the file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        let mut pipeline = Self::from_yaml(&content)?;
        pipeline.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(pipeline)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut pipeline: Self =
            serde_yaml::from_str(content).context("Failed to parse pipeline YAML")?;
        pipeline.base_dir = PathBuf::from(".");
        Ok(pipeline)
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        let mut seen = HashSet::new();

        for (i, step) in self.steps.iter().enumerate() {
            if let PipelineStep::Group(group) = step {
                if group.group.is_empty() {
                    anyhow::bail!("Step {} is a group with an empty name", i);
                }
                if group.stages.is_empty() {
                    anyhow::bail!("Group '{}' has no stages", group.group);
                }
            }

            for stage in step.members() {
                if !is_safe_component(&stage.name) {
                    anyhow::bail!(
                        "Stage name '{}' must be non-empty and use only letters, digits, '_', '-' or '.'",
                        stage.name
                    );
                }
                if !seen.insert(stage.name.as_str()) {
                    anyhow::bail!("Stage '{}' is declared more than once", stage.name);
                }
                if let Some(ref command) = stage.command {
                    if command.is_empty() {
                        anyhow::bail!("Stage '{}' has an empty command", stage.name);
                    }
                }
            }
        }

        Ok(())
    }

    /// Every phase referenced by a checkpoint
    pub fn phases(&self) -> BTreeSet<&str> {
        self.steps.iter().filter_map(PipelineStep::phase).collect()
    }

    /// Effective cache TTL for a stage
    pub fn ttl_for(&self, stage: &StageSpec) -> Duration {
        Duration::from_secs(stage.ttl_seconds.unwrap_or(self.default_ttl_seconds))
    }

    /// Effective timeout for a stage
    pub fn timeout_for(&self, stage: &StageSpec) -> Duration {
        Duration::from_secs(stage.timeout_seconds.unwrap_or(self.default_timeout_seconds))
    }
}

/// One checkpoint in a pipeline
///
/// Supports two YAML formats:
/// - Single stage: `- name: research`
/// - Parallel group: `- { group: review, stages: [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineStep {
    /// Independent stages that run concurrently and aggregate together
    Group(ParallelGroup),

    /// A single stage
    Stage(StageSpec),
}

impl PipelineStep {
    /// Checkpoint name
    pub fn name(&self) -> &str {
        match self {
            PipelineStep::Group(group) => &group.group,
            PipelineStep::Stage(stage) => &stage.name,
        }
    }

    /// Stages that report to this checkpoint
    pub fn members(&self) -> &[StageSpec] {
        match self {
            PipelineStep::Group(group) => &group.stages,
            PipelineStep::Stage(stage) => std::slice::from_ref(stage),
        }
    }

    /// Policy phase for this checkpoint
    pub fn phase(&self) -> Option<&str> {
        match self {
            PipelineStep::Group(group) => group.phase.as_deref(),
            PipelineStep::Stage(stage) => stage.phase.as_deref(),
        }
    }
}

/// A parallel group of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    /// Group name (checkpoint name)
    pub group: String,

    /// Policy phase applied when aggregating the group
    #[serde(default)]
    pub phase: Option<String>,

    pub stages: Vec<StageSpec>,
}

/// A single stage declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name (unique within pipeline, used as the cache key prefix)
    pub name: String,

    /// Command to run as the stage collaborator (argv)
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Inputs that make up the cache key
    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    /// Override cache TTL for this stage
    pub ttl_seconds: Option<u64>,

    /// Override timeout for this stage
    pub timeout_seconds: Option<u64>,

    /// Disabled stages contribute a skip record
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether results may be cached and reused
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Policy phase when this stage is its own checkpoint
    #[serde(default)]
    pub phase: Option<String>,
}

fn default_true() -> bool {
    true
}

impl StageSpec {
    /// Minimal in-code declaration
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            inputs: Vec::new(),
            ttl_seconds: None,
            timeout_seconds: None,
            enabled: true,
            cache: true,
            phase: None,
        }
    }
}
