//! Core coordination logic.
//!
//! This module contains:
//! - Cache: Content-addressed, TTL-bounded record cache
//! - Inputs: Declared stage inputs and their resolution
//! - Policy: Conflict policy loading and validation
//! - Aggregation: Weighted-vote consensus per checkpoint
//! - AuditLog: Append-only audit logging
//! - Pipeline: Pipeline definitions and loading
//! - Coordinator: Main execution engine

pub mod aggregation;
pub mod audit_log;
pub mod cache;
pub mod coordinator;
pub mod inputs;
pub mod pipeline;
pub mod policy;

// Re-export commonly used types
pub use aggregation::{aggregate, effective_confidence, AggregationError, AggregationResult, EscalationReason};
pub use audit_log::{AuditLog, RunLock};
pub use cache::{hash_inputs, CacheEntry, CacheError, CacheLookup, CacheStats, CacheStore};
pub use coordinator::{cancellation, CancelHandle, CancelSignal, Coordinator, RunReport};
pub use inputs::{resolve_inputs, DeclaredInput, InputSpec};
pub use pipeline::{ParallelGroup, Pipeline, PipelineStep, StageSpec};
pub use policy::{
    load_policy, ConflictPolicy, EscalationAction, EscalationConfig, PolicyConfigError,
    PolicyOverride, PolicySet, TimeoutAction,
};
