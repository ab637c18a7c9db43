//! Run state and reconstruction from the audit log.
//!
//! A Run represents a single coordinator pass over a pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::{AuditEntry, AuditEventType};

/// A pipeline coordination run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being coordinated
    pub pipeline_name: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run stopped (completed, paused, halted or failed)
    pub completed_at: Option<DateTime<Utc>>,

    /// Index of the next checkpoint to process
    pub next_checkpoint: usize,

    /// Per-stage state (stage name -> state)
    pub stage_states: BTreeMap<String, StageState>,

    /// Per-checkpoint state (checkpoint index -> state)
    pub checkpoint_states: BTreeMap<usize, CheckpointState>,

    /// Payload handed to the next checkpoint
    pub forwarded_payload: serde_json::Value,
}

impl Run {
    /// Create a new run for a pipeline
    pub fn new(id: Uuid, pipeline_name: String) -> Self {
        Self {
            id,
            pipeline_name,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            next_checkpoint: 0,
            stage_states: BTreeMap::new(),
            checkpoint_states: BTreeMap::new(),
            forwarded_payload: serde_json::Value::Null,
        }
    }

    /// Reconstruct run state from a sequence of audit entries
    pub fn from_entries(entries: &[AuditEntry]) -> Option<Self> {
        let first = entries.first()?;

        let mut run = Self::new(first.run_id, String::new());
        run.started_at = first.timestamp;

        for entry in entries {
            run.apply_entry(entry);
        }

        Some(run)
    }

    /// Apply a single audit entry to update run state
    pub fn apply_entry(&mut self, entry: &AuditEntry) {
        match entry.event_type {
            AuditEventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = entry.timestamp;
                if let Some(name) = detail_str(entry, "pipeline") {
                    self.pipeline_name = name;
                }
            }
            AuditEventType::RunResumed => {
                self.state = RunState::Running;
                self.completed_at = None;
            }
            AuditEventType::StageStarted => self.set_stage(entry, StageState::Running),
            AuditEventType::CacheHit => self.set_stage(entry, StageState::Cached),
            AuditEventType::StageExecuted => self.set_stage(entry, StageState::Executed),
            AuditEventType::StageSkipped => self.set_stage(entry, StageState::Skipped),
            AuditEventType::StageFailed => self.set_stage(entry, StageState::Failed),
            AuditEventType::StageTimedOut => self.set_stage(entry, StageState::TimedOut),
            AuditEventType::StageCancelled => self.set_stage(entry, StageState::Cancelled),
            AuditEventType::CacheMiss | AuditEventType::RecordRejected => {}
            AuditEventType::CheckpointAggregated => {
                self.set_checkpoint(entry, CheckpointState::Aggregated);
            }
            AuditEventType::EscalationRaised => {
                self.set_checkpoint(entry, CheckpointState::Escalated);
            }
            AuditEventType::CheckpointContinued => {
                if let Some(idx) = entry.checkpoint {
                    let state = self
                        .checkpoint_states
                        .entry(idx)
                        .or_insert(CheckpointState::Continue);
                    if *state != CheckpointState::Escalated {
                        *state = CheckpointState::Continue;
                    }
                    self.next_checkpoint = idx + 1;
                }
                self.forwarded_payload = detail_payload(entry);
            }
            AuditEventType::EscalationResolved => {}
            AuditEventType::RunPaused => {
                self.state = RunState::Paused {
                    checkpoint: entry.checkpoint.unwrap_or(self.next_checkpoint),
                    reason: entry.summary.clone(),
                };
                self.forwarded_payload = detail_payload(entry);
                self.completed_at = Some(entry.timestamp);
            }
            AuditEventType::RunHalted => {
                self.set_checkpoint(entry, CheckpointState::Halted);
                self.state = RunState::Halted {
                    reason: entry.error.clone().unwrap_or_else(|| entry.summary.clone()),
                };
                self.completed_at = Some(entry.timestamp);
            }
            AuditEventType::RunFailed => {
                self.state = RunState::Failed {
                    error: entry.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(entry.timestamp);
            }
            AuditEventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(entry.timestamp);
            }
        }
    }

    fn set_stage(&mut self, entry: &AuditEntry, state: StageState) {
        if let Some(ref stage_id) = entry.stage_id {
            self.stage_states.insert(stage_id.clone(), state);
        }
    }

    fn set_checkpoint(&mut self, entry: &AuditEntry, state: CheckpointState) {
        if let Some(idx) = entry.checkpoint {
            self.checkpoint_states.insert(idx, state);
        }
    }

    /// Check if the run has stopped for good
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            RunState::Completed | RunState::Halted { .. } | RunState::Failed { .. }
        )
    }
}

fn detail_str(entry: &AuditEntry, key: &str) -> Option<String> {
    entry
        .details
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn detail_payload(entry: &AuditEntry) -> serde_json::Value {
    entry
        .details
        .as_ref()
        .and_then(|d| d.get("payload"))
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

/// State of a coordination run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Waiting for external confirmation at a checkpoint
    Paused { checkpoint: usize, reason: String },

    /// Every checkpoint passed
    Completed,

    /// Stopped by policy or cancellation
    Halted { reason: String },

    /// Stopped by a fatal error
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

/// State of a single stage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet reached
    Pending,

    /// Cache check or execution in progress
    Running,

    /// Served from cache
    Cached,

    /// Collaborator ran successfully
    Executed,

    /// Disabled or unavailable
    Skipped,

    /// Collaborator exceeded its timeout
    TimedOut,

    /// Collaborator returned an error
    Failed,

    /// Abandoned on cancellation
    Cancelled,
}

impl Default for StageState {
    fn default() -> Self {
        Self::Pending
    }
}

/// State of a checkpoint after aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Aggregated,
    Continue,
    Escalated,
    Halted,
}
