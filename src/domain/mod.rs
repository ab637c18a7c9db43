//! Domain types for the quorum coordinator.
//!
//! This module contains the core data structures:
//! - Record: Validated stage output and the decision set
//! - Outcome: Terminal state of a stage slot
//! - Audit: Append-only history entries
//! - Run: Run state rebuilt from the audit log
//! - Summary: End-of-run report

pub mod audit;
pub mod outcome;
pub mod record;
pub mod run;
pub mod summary;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditEventType};
pub use outcome::StageOutcome;
pub use record::{
    Decision, OutputRecord, StageResult, ValidationError, FLAG_CANCELLED, FLAG_STAGE_DISABLED,
    FLAG_STAGE_ERROR, FLAG_STAGE_UNAVAILABLE, FLAG_TIMEOUT,
};
pub use run::{CheckpointState, Run, RunState, StageState};
pub use summary::{CacheStatus, CheckpointSummary, RunSummary, StageSummary};
