//! Adapter interfaces for stage collaborators and operators.
//!
//! Stages are the external steps of a pipeline (research, refinement,
//! scoring scripts). The coordinator only sees them through the `Stage`
//! trait.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::aggregation::AggregationResult;
use crate::core::inputs::DeclaredInput;
use crate::core::pipeline::Pipeline;
use crate::domain::StageResult;

// Re-export the subprocess stage
pub use command::CommandStage;

/// Everything a stage gets to see for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: Uuid,
    pub stage_id: String,
    /// Resolved declared inputs
    pub inputs: Vec<DeclaredInput>,
    /// Payload forwarded from the previous checkpoint
    pub upstream: serde_json::Value,
    /// Digest of the declared inputs
    pub input_hash: String,
}

/// Trait for stage collaborators
#[async_trait]
pub trait Stage: Send + Sync {
    /// Human-readable stage name
    fn name(&self) -> &str;

    /// Run the stage once
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult>;
}

/// Stage collaborators by stage name
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator under its own name
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name().to_string(), stage);
        self
    }

    /// Build command collaborators for every stage that declares a command
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        let mut registry = Self::new();
        for step in &pipeline.steps {
            for spec in step.members() {
                if let Some(ref argv) = spec.command {
                    let stage = CommandStage::new(spec.name.clone(), argv.clone())
                        .with_working_dir(pipeline.base_dir.clone());
                    registry.register(Arc::new(stage));
                }
            }
        }
        registry
    }

    pub fn get(&self, stage_id: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(stage_id).cloned()
    }

    pub fn contains(&self, stage_id: &str) -> bool {
        self.stages.contains_key(stage_id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// An escalation awaiting an operator decision
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRequest {
    pub run_id: Uuid,
    pub checkpoint: usize,
    pub checkpoint_name: String,
    pub result: AggregationResult,
}

/// Operator answer to an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationResolution {
    Approve,
    Reject,
}

/// Trait for whoever confirms escalated checkpoints
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn confirm(&self, request: &EscalationRequest) -> Result<EscalationResolution>;
}
