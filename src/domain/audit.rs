//! Audit entries for the append-only run history.
//!
//! Every coordinator transition is recorded before the run moves on, so the
//! log alone is enough to explain why a run paused, escalated or halted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a run's audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// When this entry was written (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this entry belongs to
    pub run_id: Uuid,

    /// Type of event
    pub event_type: AuditEventType,

    /// Checkpoint index within the pipeline (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<usize>,

    /// Stage name (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Input digest used as the cache key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,

    /// Time taken in milliseconds (for executed stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error or reason text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Structured detail (aggregation result, forwarded payload, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Create a new entry with the current timestamp
    pub fn new(run_id: Uuid, event_type: AuditEventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            checkpoint: None,
            stage_id: None,
            summary: summary.into(),
            input_hash: None,
            duration_ms: None,
            error: None,
            details: None,
        }
    }

    pub fn at_checkpoint(mut self, checkpoint: usize) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn for_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn with_input_hash(mut self, digest: impl Into<String>) -> Self {
        self.input_hash = Some(digest.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Types of events recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A new run has started
    RunStarted,

    /// A paused run was picked up again
    RunResumed,

    /// A stage slot moved from pending to running
    StageStarted,

    /// A valid cache entry was reused
    CacheHit,

    /// No usable cache entry (missing, expired or corrupt)
    CacheMiss,

    /// The collaborator ran and its record was stored
    StageExecuted,

    /// The stage was disabled or had no collaborator
    StageSkipped,

    /// The collaborator returned an error
    StageFailed,

    /// The collaborator exceeded its timeout
    StageTimedOut,

    /// The stage was abandoned because the run was cancelled
    StageCancelled,

    /// A collaborator result failed record validation
    RecordRejected,

    /// A checkpoint's records were aggregated
    CheckpointAggregated,

    /// A checkpoint passed and the run advanced
    CheckpointContinued,

    /// A checkpoint required escalation
    EscalationRaised,

    /// An operator (or handler) answered an escalation
    EscalationResolved,

    /// The run is waiting for external confirmation
    RunPaused,

    /// The run was stopped before completing
    RunHalted,

    /// The run could not continue because of a fatal error
    RunFailed,

    /// Every checkpoint passed
    RunCompleted,
}
