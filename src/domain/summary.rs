//! Run summary written at the end of a run for downstream reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::Decision;
use super::run::{CheckpointState, RunState};

/// How the cache answered for a stage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    Expired,
    Corrupt,
    /// Cache not consulted (disabled stage or `cache: false`)
    Bypassed,
}

/// One row per stage slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub checkpoint: usize,
    pub stage_id: String,
    pub cache: CacheStatus,
    pub outcome: String,
    pub decision: Decision,
    pub confidence: f64,
    pub flags: Vec<String>,
}

/// One row per aggregated checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub index: usize,
    pub name: String,
    pub consensus: Decision,
    pub aggregate_confidence: f64,
    pub needs_escalation: bool,
    pub escalation_reasons: Vec<String>,
    pub flagged_concerns: Vec<String>,
    pub state: CheckpointState,
    /// Escalation action applied, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Summary artifact for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageSummary>,
    pub checkpoints: Vec<CheckpointSummary>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            state: RunState::Running,
            generated_at: Utc::now(),
            stages: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Number of stage slots served from cache
    pub fn cache_hits(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.cache == CacheStatus::Hit)
            .count()
    }

    /// Number of checkpoints that escalated
    pub fn escalations(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.needs_escalation).count()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageSummary> {
        self.stages.iter().rev().find(|s| s.stage_id == stage_id)
    }
}
