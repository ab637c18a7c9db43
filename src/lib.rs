//! quorum - Cache-aware stage coordinator with weighted-vote consensus
//!
//! Coordinates multi-stage agent pipelines: each stage's output is
//! validated into a record, reused from a content-addressed cache when its
//! declared inputs are unchanged, and combined with its checkpoint peers
//! through a configurable weighted vote.
//!
//! # Architecture
//!
//! The run history is event sourced:
//! - Every coordinator transition is appended to a per-run audit log
//! - Run state is derived by replaying the log
//! - Runs paused at an escalated checkpoint can be resumed later
//!
//! # Modules
//!
//! - `adapters`: Stage collaborators and escalation handlers
//! - `core`: Cache, policy, aggregation, audit log, coordinator
//! - `domain`: Data structures (OutputRecord, AuditEntry, Run, RunSummary)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! quorum run validation --policy policy.yaml
//!
//! # Confirm an escalated checkpoint
//! quorum resume <run-id> --approve
//!
//! # Check run status
//! quorum status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{EscalationHandler, EscalationResolution, Stage, StageContext, StageRegistry};
pub use crate::core::{
    aggregate, cancellation, CacheStore, ConflictPolicy, Coordinator, Pipeline, PolicySet,
};
pub use domain::{Decision, OutputRecord, Run, RunState, StageResult};
