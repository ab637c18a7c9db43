//! Weighted-vote consensus over the records of one checkpoint.
//!
//! The engine is a pure function of its inputs: the same records and policy
//! always produce the same decision and confidence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Decision, OutputRecord, ValidationError};

use super::policy::ConflictPolicy;

/// Float slack for comparing weighted sums
const EPSILON: f64 = 1e-9;

/// Aggregation failures
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Malformed record from stage '{stage_id}': {source}")]
    MalformedRecord {
        stage_id: String,
        #[source]
        source: ValidationError,
    },
}

/// Why a checkpoint needs escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum EscalationReason {
    /// A record carried a hard-block flag
    HardBlockFlag { stage_id: String, flag: String },

    /// Confident records disagree and no bucket dominates
    Disagreement { decisions: Vec<Decision>, top_share: f64 },

    /// Aggregate confidence below the minimum
    LowConfidence { aggregate: f64, minimum: f64 },

    /// Fewer than two records took part
    InsufficientSignal { participants: usize },
}

impl EscalationReason {
    pub fn is_hard_block(&self) -> bool {
        matches!(self, EscalationReason::HardBlockFlag { .. })
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::HardBlockFlag { stage_id, flag } => {
                write!(f, "hard-block flag '{}' from {}", flag, stage_id)
            }
            EscalationReason::Disagreement { decisions, top_share } => {
                let names: Vec<&str> = decisions.iter().map(Decision::as_str).collect();
                write!(
                    f,
                    "disagreement between {} (top share {:.2})",
                    names.join("/"),
                    top_share
                )
            }
            EscalationReason::LowConfidence { aggregate, minimum } => {
                write!(f, "aggregate confidence {:.3} below {:.3}", aggregate, minimum)
            }
            EscalationReason::InsufficientSignal { participants } => {
                write!(f, "only {} participating record(s)", participants)
            }
        }
    }
}

/// Consensus for one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub consensus_decision: Decision,
    pub aggregate_confidence: f64,
    pub needs_escalation: bool,
    /// Union of every participating record's flags
    pub flagged_concerns: BTreeSet<String>,
    pub escalation_reasons: Vec<EscalationReason>,
    /// Weighted sum per decision bucket
    pub tally: BTreeMap<Decision, f64>,
    /// Winning bucket's share of the total weighted sum
    pub top_share: f64,
    /// Record whose payload is forwarded (highest weighted vote in the winning bucket)
    pub winning_stage: Option<String>,
    pub participants: usize,
    pub reasoning: String,
}

impl AggregationResult {
    pub fn has_hard_block(&self) -> bool {
        self.escalation_reasons.iter().any(EscalationReason::is_hard_block)
    }

    /// Payload of the winning record, if any
    pub fn winning_payload(&self, records: &[OutputRecord]) -> serde_json::Value {
        self.winning_stage
            .as_deref()
            .and_then(|stage| records.iter().find(|r| r.stage_id() == stage))
            .map(|r| r.payload().clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Confidence after deducting the soft-flag penalty, floored at 0
pub fn effective_confidence(record: &OutputRecord, policy: &ConflictPolicy) -> f64 {
    let soft_flags = record
        .flags()
        .iter()
        .filter(|f| !policy.is_hard_block(f))
        .count();
    (record.confidence() - policy.soft_flag_penalty * soft_flags as f64).max(0.0)
}

/// Combine a checkpoint's records into a consensus decision
pub fn aggregate(
    records: &[OutputRecord],
    policy: &ConflictPolicy,
) -> Result<AggregationResult, AggregationError> {
    for record in records {
        record
            .validate()
            .map_err(|source| AggregationError::MalformedRecord {
                stage_id: record.stage_id().to_string(),
                source,
            })?;
    }

    if records.is_empty() {
        return Ok(AggregationResult {
            consensus_decision: Decision::Skip,
            aggregate_confidence: 0.0,
            needs_escalation: true,
            flagged_concerns: BTreeSet::new(),
            escalation_reasons: vec![EscalationReason::InsufficientSignal { participants: 0 }],
            tally: BTreeMap::new(),
            top_share: 0.0,
            winning_stage: None,
            participants: 0,
            reasoning: "Insufficient data: no records reached this checkpoint".to_string(),
        });
    }

    let effective: Vec<f64> = records
        .iter()
        .map(|r| effective_confidence(r, policy))
        .collect();
    let weights: Vec<f64> = records.iter().map(|r| policy.weight(r.stage_id())).collect();

    // Weighted vote tally
    let mut tally: BTreeMap<Decision, f64> = BTreeMap::new();
    for ((record, eff), weight) in records.iter().zip(&effective).zip(&weights) {
        *tally.entry(record.decision()).or_insert(0.0) += weight * eff;
    }
    let total: f64 = tally.values().sum();

    // Skip only wins when nothing else was decided
    let only_skip = tally.keys().all(|d| *d == Decision::Skip);
    let consensus = tally
        .iter()
        .filter(|(d, _)| only_skip || **d != Decision::Skip)
        .fold(None::<(Decision, f64)>, |best, (decision, sum)| match best {
            None => Some((*decision, *sum)),
            Some((best_d, best_sum)) => {
                if *sum > best_sum + EPSILON
                    || ((*sum - best_sum).abs() <= EPSILON
                        && policy.priority_rank(*decision) < policy.priority_rank(best_d))
                {
                    Some((*decision, *sum))
                } else {
                    Some((best_d, best_sum))
                }
            }
        })
        .map(|(d, _)| d)
        .unwrap_or(Decision::Skip);

    let top_sum = tally.get(&consensus).copied().unwrap_or(0.0);
    let top_share = if total > EPSILON { top_sum / total } else { 0.0 };

    // Weighted mean of effective confidence; plain mean when every weight is zero
    let weight_sum: f64 = weights.iter().sum();
    let aggregate_confidence = if weight_sum > EPSILON {
        effective
            .iter()
            .zip(&weights)
            .map(|(e, w)| e * w)
            .sum::<f64>()
            / weight_sum
    } else {
        effective.iter().sum::<f64>() / effective.len() as f64
    };

    let flagged_concerns: BTreeSet<String> = records
        .iter()
        .flat_map(|r| r.flags().iter().cloned())
        .collect();

    let mut reasons = Vec::new();

    for record in records {
        for flag in record.flags() {
            if policy.is_hard_block(flag) {
                reasons.push(EscalationReason::HardBlockFlag {
                    stage_id: record.stage_id().to_string(),
                    flag: flag.clone(),
                });
            }
        }
    }

    let confident: BTreeSet<Decision> = records
        .iter()
        .zip(&effective)
        .filter(|(_, eff)| **eff > policy.minimum_confidence)
        .map(|(r, _)| r.decision())
        .collect();
    if confident.len() > 1 && top_share <= policy.strong_consensus {
        reasons.push(EscalationReason::Disagreement {
            decisions: confident.into_iter().collect(),
            top_share,
        });
    }

    if aggregate_confidence < policy.minimum_confidence {
        reasons.push(EscalationReason::LowConfidence {
            aggregate: aggregate_confidence,
            minimum: policy.minimum_confidence,
        });
    }

    if records.len() < 2 && !policy.accept_single_source {
        reasons.push(EscalationReason::InsufficientSignal {
            participants: records.len(),
        });
    }

    let winning_stage = records
        .iter()
        .zip(effective.iter().zip(&weights))
        .filter(|(r, _)| r.decision() == consensus)
        .fold(None::<(&OutputRecord, f64)>, |best, (record, (eff, w))| {
            let vote = eff * w;
            match best {
                Some((_, best_vote)) if vote <= best_vote + EPSILON => best,
                _ => Some((record, vote)),
            }
        })
        .map(|(r, _)| r.stage_id().to_string());

    let needs_escalation = !reasons.is_empty();
    let reasoning = if needs_escalation {
        let parts: Vec<String> = reasons.iter().map(ToString::to_string).collect();
        format!(
            "Consensus {} at {:.3}; escalation required: {}",
            consensus,
            aggregate_confidence,
            parts.join("; ")
        )
    } else {
        format!(
            "Consensus {} at {:.3} from {} record(s)",
            consensus,
            aggregate_confidence,
            records.len()
        )
    };

    Ok(AggregationResult {
        consensus_decision: consensus,
        aggregate_confidence,
        needs_escalation,
        flagged_concerns,
        escalation_reasons: reasons,
        tally,
        top_share,
        winning_stage,
        participants: records.len(),
        reasoning,
    })
}
