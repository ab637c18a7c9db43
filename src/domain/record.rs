//! Output records emitted by pipeline stages.
//!
//! A record is validated when it is built and never changes afterwards.
//! Deserialization goes through the same validation, so a record read back
//! from the cache or the audit log is as trustworthy as a freshly built one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flag attached to records synthesized for stages that are switched off
pub const FLAG_STAGE_DISABLED: &str = "stage_disabled";

/// Flag attached to records synthesized for stages with no collaborator
pub const FLAG_STAGE_UNAVAILABLE: &str = "stage_unavailable";

/// Flag attached when the collaborator returned an error
pub const FLAG_STAGE_ERROR: &str = "stage_error";

/// Flag attached when the collaborator exceeded its timeout
pub const FLAG_TIMEOUT: &str = "timeout";

/// Flag attached when the run was cancelled before the stage finished
pub const FLAG_CANCELLED: &str = "cancelled";

/// Record validation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Stage id cannot be empty")]
    EmptyStageId,

    #[error("Unknown decision '{0}' (expected approve, reject, conditional or skip)")]
    UnknownDecision(String),

    #[error("Confidence {0} is outside [0.0, 1.0]")]
    ConfidenceOutOfRange(f64),

    #[error("Flag names cannot be empty")]
    EmptyFlag,
}

/// The closed set of decisions a stage can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Conditional,
    Skip,
}

impl Decision {
    /// Every decision, in declaration order
    pub const ALL: [Decision; 4] = [
        Decision::Approve,
        Decision::Reject,
        Decision::Conditional,
        Decision::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Conditional => "conditional",
            Decision::Skip => "skip",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            "conditional" => Ok(Decision::Conditional),
            "skip" => Ok(Decision::Skip),
            _ => Err(ValidationError::UnknownDecision(s.to_string())),
        }
    }
}

/// The structured result of one stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct OutputRecord {
    stage_id: String,
    decision: Decision,
    reasoning: String,
    confidence: f64,
    flags: BTreeSet<String>,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl OutputRecord {
    /// Build a validated record stamped with the current time
    pub fn new<I, S>(
        stage_id: impl Into<String>,
        decision: Decision,
        reasoning: impl Into<String>,
        confidence: f64,
        flags: I,
        payload: serde_json::Value,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = Self {
            stage_id: stage_id.into(),
            decision,
            reasoning: reasoning.into(),
            confidence,
            flags: flags.into_iter().map(Into::into).collect(),
            payload,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Record for a stage that did not produce a real result.
    ///
    /// Always `skip` with zero confidence so it carries weight in the
    /// aggregation denominators without ever winning a vote.
    pub fn skip_record(
        stage_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(
            stage_id,
            Decision::Skip,
            reason,
            0.0,
            Vec::<String>::new(),
            serde_json::Value::Null,
        )
    }

    /// `skip_record` carrying an explanatory flag
    pub fn skip_record_flagged(
        stage_id: impl Into<String>,
        reason: impl Into<String>,
        flag: &str,
    ) -> Result<Self, ValidationError> {
        Self::new(
            stage_id,
            Decision::Skip,
            reason,
            0.0,
            [flag],
            serde_json::Value::Null,
        )
    }

    /// Replace the creation timestamp (used by the run clock)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check every record invariant
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stage_id.trim().is_empty() {
            return Err(ValidationError::EmptyStageId);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        if self.flags.iter().any(|f| f.trim().is_empty()) {
            return Err(ValidationError::EmptyFlag);
        }
        Ok(())
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }
}

/// Unvalidated wire shape of a record
#[derive(Deserialize)]
struct RawRecord {
    stage_id: String,
    decision: String,
    reasoning: String,
    confidence: f64,
    #[serde(default)]
    flags: BTreeSet<String>,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawRecord> for OutputRecord {
    type Error = ValidationError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let record = Self {
            stage_id: raw.stage_id,
            decision: raw.decision.parse()?,
            reasoning: raw.reasoning,
            confidence: raw.confidence,
            flags: raw.flags,
            payload: raw.payload,
            timestamp: raw.timestamp,
            metadata: raw.metadata,
        };
        record.validate()?;
        Ok(record)
    }
}

/// What a stage collaborator hands back before validation.
///
/// `decision` stays a string here: collaborators are often LLM-backed
/// scripts and the closed set is enforced when the result becomes a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub decision: String,

    #[serde(default)]
    pub reasoning: String,

    pub confidence: f64,

    #[serde(default)]
    pub flags: Vec<String>,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageResult {
    /// Convenience constructor for in-process collaborators
    pub fn new(decision: Decision, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            decision: decision.as_str().to_string(),
            reasoning: reasoning.into(),
            confidence,
            flags: Vec::new(),
            payload: serde_json::Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate and wrap into a record for `stage_id`
    pub fn into_record(self, stage_id: &str) -> Result<OutputRecord, ValidationError> {
        let decision: Decision = self.decision.parse()?;
        let mut record = OutputRecord::new(
            stage_id,
            decision,
            self.reasoning,
            self.confidence,
            self.flags,
            self.payload,
        )?;
        record.metadata = self.metadata;
        Ok(record)
    }
}
