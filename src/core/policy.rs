//! Conflict policy loading and validation.
//!
//! A policy file holds a base policy plus optional per-phase overrides.
//! Every phase is merged and validated at load time so a run never starts
//! with a policy that could fail halfway through.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Decision;

/// Policy configuration failures (fatal at load time)
#[derive(Debug, Error)]
pub enum PolicyConfigError {
    #[error("Failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy: {0}")]
    Parse(String),

    #[error("Weight for '{stage}' must be a finite non-negative number, got {weight}")]
    InvalidWeight { stage: String, weight: f64 },

    #[error("{name} must be within [0.0, 1.0], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("strong_consensus ({strong}) must be >= minimum_confidence ({minimum})")]
    StrongBelowMinimum { strong: f64, minimum: f64 },

    #[error("decision_priority lists '{0}' more than once")]
    DuplicatePriority(Decision),

    #[error("Hard-block flag names cannot be empty")]
    EmptyHardBlockFlag,

    #[error("Unknown policy phase '{0}'")]
    UnknownPhase(String),

    #[error("Phase '{phase}' is invalid: {source}")]
    InvalidPhase {
        phase: String,
        #[source]
        source: Box<PolicyConfigError>,
    },
}

/// What the coordinator does when a checkpoint escalates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Record the escalation and keep going
    ProceedConditionally,

    /// Wait for an operator (or handler) to confirm
    AwaitConfirmation,

    /// Stop the run
    Halt,
}

impl EscalationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationAction::ProceedConditionally => "proceed_conditionally",
            EscalationAction::AwaitConfirmation => "await_confirmation",
            EscalationAction::Halt => "halt",
        }
    }
}

/// What happens when confirmation does not arrive in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Halt,
    Proceed,
}

/// Escalation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    /// Action for escalated checkpoints. With none configured, a hard-block
    /// escalation halts and any other escalation awaits confirmation.
    #[serde(default)]
    pub default_action: Option<EscalationAction>,

    /// How long to wait for confirmation
    #[serde(default = "default_escalation_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_on_timeout")]
    pub on_timeout: TimeoutAction,
}

fn default_escalation_timeout() -> u64 {
    3600
}
fn default_on_timeout() -> TimeoutAction {
    TimeoutAction::Halt
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            default_action: None,
            timeout_seconds: default_escalation_timeout(),
            on_timeout: default_on_timeout(),
        }
    }
}

impl EscalationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Resolve the action for an escalation; `None` means halt
    pub fn action_for(&self, hard_blocked: bool) -> Option<EscalationAction> {
        match self.default_action {
            Some(action) => Some(action),
            None if hard_blocked => None,
            None => Some(EscalationAction::AwaitConfirmation),
        }
    }
}

/// Immutable conflict-resolution settings for one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConflictPolicy {
    /// Per-stage vote weights
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,

    /// Weight for stages without an explicit entry
    #[serde(default = "default_weight")]
    pub default_weight: f64,

    /// Aggregate confidence below this escalates
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence: f64,

    /// Top-bucket share above this overrides disagreement
    #[serde(default = "default_strong_consensus")]
    pub strong_consensus: f64,

    /// Confidence deducted per non-hard flag
    #[serde(default = "default_soft_flag_penalty")]
    pub soft_flag_penalty: f64,

    /// Flags that always force escalation
    #[serde(default)]
    pub hard_block_flags: BTreeSet<String>,

    /// Tie-break order, first wins
    #[serde(default = "default_decision_priority")]
    pub decision_priority: Vec<Decision>,

    /// Accept a checkpoint with a single participating record
    #[serde(default)]
    pub accept_single_source: bool,

    #[serde(default)]
    pub escalation: EscalationConfig,
}

fn default_weight() -> f64 {
    1.0
}
fn default_minimum_confidence() -> f64 {
    0.7
}
fn default_strong_consensus() -> f64 {
    0.8
}
fn default_soft_flag_penalty() -> f64 {
    0.05
}
fn default_decision_priority() -> Vec<Decision> {
    vec![
        Decision::Reject,
        Decision::Conditional,
        Decision::Approve,
        Decision::Skip,
    ]
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: default_weight(),
            minimum_confidence: default_minimum_confidence(),
            strong_consensus: default_strong_consensus(),
            soft_flag_penalty: default_soft_flag_penalty(),
            hard_block_flags: BTreeSet::new(),
            decision_priority: default_decision_priority(),
            accept_single_source: false,
            escalation: EscalationConfig::default(),
        }
    }
}

impl ConflictPolicy {
    /// Vote weight for a stage
    pub fn weight(&self, stage_id: &str) -> f64 {
        self.weights
            .get(stage_id)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn is_hard_block(&self, flag: &str) -> bool {
        self.hard_block_flags.contains(flag)
    }

    /// Position of a decision in the tie-break order.
    ///
    /// Decisions missing from `decision_priority` rank after listed ones,
    /// in the default conservative order.
    pub fn priority_rank(&self, decision: Decision) -> usize {
        if let Some(pos) = self.decision_priority.iter().position(|d| *d == decision) {
            return pos;
        }
        let fallback = default_decision_priority()
            .iter()
            .position(|d| *d == decision)
            .unwrap_or(Decision::ALL.len());
        self.decision_priority.len() + fallback
    }

    /// Check every policy invariant
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        check_weight("default_weight", self.default_weight)?;
        for (stage, weight) in &self.weights {
            check_weight(stage, *weight)?;
        }

        check_unit("minimum_confidence", self.minimum_confidence)?;
        check_unit("strong_consensus", self.strong_consensus)?;
        check_unit("soft_flag_penalty", self.soft_flag_penalty)?;

        if self.strong_consensus < self.minimum_confidence {
            return Err(PolicyConfigError::StrongBelowMinimum {
                strong: self.strong_consensus,
                minimum: self.minimum_confidence,
            });
        }

        let mut seen = BTreeSet::new();
        for decision in &self.decision_priority {
            if !seen.insert(*decision) {
                return Err(PolicyConfigError::DuplicatePriority(*decision));
            }
        }

        if self.hard_block_flags.iter().any(|f| f.trim().is_empty()) {
            return Err(PolicyConfigError::EmptyHardBlockFlag);
        }

        Ok(())
    }

    /// Apply an override; the override wins per key
    pub fn merged(&self, over: &PolicyOverride) -> ConflictPolicy {
        let mut merged = self.clone();

        for (stage, weight) in &over.weights {
            merged.weights.insert(stage.clone(), *weight);
        }
        if let Some(v) = over.default_weight {
            merged.default_weight = v;
        }
        if let Some(v) = over.minimum_confidence {
            merged.minimum_confidence = v;
        }
        if let Some(v) = over.strong_consensus {
            merged.strong_consensus = v;
        }
        if let Some(v) = over.soft_flag_penalty {
            merged.soft_flag_penalty = v;
        }
        if let Some(ref flags) = over.hard_block_flags {
            merged.hard_block_flags = flags.clone();
        }
        if let Some(ref priority) = over.decision_priority {
            merged.decision_priority = priority.clone();
        }
        if let Some(v) = over.accept_single_source {
            merged.accept_single_source = v;
        }
        if let Some(ref esc) = over.escalation {
            if esc.default_action.is_some() {
                merged.escalation.default_action = esc.default_action;
            }
            if let Some(v) = esc.timeout_seconds {
                merged.escalation.timeout_seconds = v;
            }
            if let Some(v) = esc.on_timeout {
                merged.escalation.on_timeout = v;
            }
        }

        merged
    }
}

fn check_weight(stage: &str, weight: f64) -> Result<(), PolicyConfigError> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(PolicyConfigError::InvalidWeight {
            stage: stage.to_string(),
            weight,
        });
    }
    Ok(())
}

fn check_unit(name: &'static str, value: f64) -> Result<(), PolicyConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(PolicyConfigError::ThresholdOutOfRange { name, value });
    }
    Ok(())
}

/// Per-phase override; unset keys inherit from the base policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    pub default_weight: Option<f64>,
    pub minimum_confidence: Option<f64>,
    pub strong_consensus: Option<f64>,
    pub soft_flag_penalty: Option<f64>,
    pub hard_block_flags: Option<BTreeSet<String>>,
    pub decision_priority: Option<Vec<Decision>>,
    pub accept_single_source: Option<bool>,
    pub escalation: Option<EscalationOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationOverride {
    pub default_action: Option<EscalationAction>,
    pub timeout_seconds: Option<u64>,
    pub on_timeout: Option<TimeoutAction>,
}

/// Validated base policy plus every merged phase, loaded once per run
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    base: ConflictPolicy,
    phases: BTreeMap<String, ConflictPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            base: ConflictPolicy::default(),
            phases: BTreeMap::new(),
        }
    }
}

impl PolicySet {
    /// Build from a single validated policy with no phases
    pub fn single(base: ConflictPolicy) -> Result<Self, PolicyConfigError> {
        base.validate()?;
        Ok(Self {
            base,
            phases: BTreeMap::new(),
        })
    }

    /// Load a policy file
    pub fn from_file(path: &Path) -> Result<Self, PolicyConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| PolicyConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate policy YAML
    pub fn from_yaml(content: &str) -> Result<Self, PolicyConfigError> {
        let parse = |e: serde_yaml::Error| PolicyConfigError::Parse(e.to_string());

        // Split `phases` off so the base keys are checked strictly
        let mut doc = match serde_yaml::from_str::<serde_yaml::Value>(content).map_err(parse)? {
            serde_yaml::Value::Mapping(mapping) => mapping,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            other => {
                return Err(PolicyConfigError::Parse(format!(
                    "expected a mapping at the top level, found {:?}",
                    other
                )))
            }
        };
        let overrides: BTreeMap<String, PolicyOverride> = match doc.remove("phases") {
            Some(value) => serde_yaml::from_value(value).map_err(parse)?,
            None => BTreeMap::new(),
        };
        let base: ConflictPolicy =
            serde_yaml::from_value(serde_yaml::Value::Mapping(doc)).map_err(parse)?;

        base.validate()?;

        let mut phases = BTreeMap::new();
        for (name, over) in &overrides {
            let merged = base.merged(over);
            merged
                .validate()
                .map_err(|e| PolicyConfigError::InvalidPhase {
                    phase: name.clone(),
                    source: Box::new(e),
                })?;
            phases.insert(name.clone(), merged);
        }

        Ok(Self { base, phases })
    }

    pub fn base(&self) -> &ConflictPolicy {
        &self.base
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.keys().map(String::as_str)
    }

    /// Policy for a phase, or the base policy when no phase is given
    pub fn for_phase(&self, phase: Option<&str>) -> Result<&ConflictPolicy, PolicyConfigError> {
        match phase {
            None => Ok(&self.base),
            Some(name) => self
                .phases
                .get(name)
                .ok_or_else(|| PolicyConfigError::UnknownPhase(name.to_string())),
        }
    }
}

/// Load a policy and resolve it for an optional phase in one step
pub fn load_policy(content: &str, phase: Option<&str>) -> Result<ConflictPolicy, PolicyConfigError> {
    let set = PolicySet::from_yaml(content)?;
    set.for_phase(phase).cloned()
}
