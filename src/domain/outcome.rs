//! Terminal outcome of a single stage slot at a checkpoint.

use serde::{Deserialize, Serialize};

use super::record::OutputRecord;

/// How a stage slot ended.
///
/// Every variant carries a well-formed record, so a checkpoint always
/// aggregates one record per declared stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "record")]
pub enum StageOutcome {
    /// The collaborator ran and returned a valid result
    Completed(OutputRecord),

    /// A valid cache entry was reused, nothing ran
    Cached(OutputRecord),

    /// Disabled or unreachable stage
    Skipped(OutputRecord),

    /// The collaborator exceeded its timeout
    TimedOut(OutputRecord),

    /// The collaborator returned an error
    Failed(OutputRecord),

    /// The run was cancelled before the stage finished
    Cancelled(OutputRecord),
}

impl StageOutcome {
    pub fn record(&self) -> &OutputRecord {
        match self {
            StageOutcome::Completed(r)
            | StageOutcome::Cached(r)
            | StageOutcome::Skipped(r)
            | StageOutcome::TimedOut(r)
            | StageOutcome::Failed(r)
            | StageOutcome::Cancelled(r) => r,
        }
    }

    pub fn into_record(self) -> OutputRecord {
        match self {
            StageOutcome::Completed(r)
            | StageOutcome::Cached(r)
            | StageOutcome::Skipped(r)
            | StageOutcome::TimedOut(r)
            | StageOutcome::Failed(r)
            | StageOutcome::Cancelled(r) => r,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Completed(_) => "completed",
            StageOutcome::Cached(_) => "cached",
            StageOutcome::Skipped(_) => "skipped",
            StageOutcome::TimedOut(_) => "timed_out",
            StageOutcome::Failed(_) => "failed",
            StageOutcome::Cancelled(_) => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::FLAG_TIMEOUT;

    #[test]
    fn test_outcome_carries_record() {
        let record = OutputRecord::skip_record_flagged("slow", "Timed out after 5s", FLAG_TIMEOUT).unwrap();
        let outcome = StageOutcome::TimedOut(record.clone());

        assert_eq!(outcome.record(), &record);
        assert_eq!(outcome.label(), "timed_out");
    }
}
