//! Coordinator Integration Tests
//!
//! Checkpoint state machine: parallel groups, timeouts, cancellation,
//! escalation actions, pause/resume and fatal record validation.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quorum::adapters::{EscalationHandler, EscalationRequest, EscalationResolution};
use quorum::core::{cancellation, AuditLog, PolicySet};
use quorum::domain::{
    AuditEventType, CheckpointState, Decision, RunState, StageResult, ValidationError,
    FLAG_CANCELLED, FLAG_TIMEOUT,
};
use serde_json::json;
use tempfile::TempDir;

use common::{calls, coordinator, pipeline, registry, Scripted};

const REVIEW_THEN_BUILD: &str = r#"
name: launch
steps:
  - group: review
    stages:
      - name: optimist
      - name: skeptic
  - name: build
"#;

fn policies(yaml: &str) -> PolicySet {
    PolicySet::from_yaml(yaml).unwrap()
}

struct Answer(EscalationResolution);

#[async_trait]
impl EscalationHandler for Answer {
    async fn confirm(&self, _request: &EscalationRequest) -> anyhow::Result<EscalationResolution> {
        Ok(self.0)
    }
}

struct Silent;

#[async_trait]
impl EscalationHandler for Silent {
    async fn confirm(&self, _request: &EscalationRequest) -> anyhow::Result<EscalationResolution> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(EscalationResolution::Approve)
    }
}

#[tokio::test]
async fn test_unanimous_group_continues_and_forwards_payload() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: unanimous
steps:
  - group: review
    stages:
      - name: market
      - name: tech
      - name: finance
  - name: build
"#;

    let market = Scripted::answering(
        "market",
        StageResult::new(Decision::Approve, "big market", 0.9).with_payload(json!({"plan": "b2b"})),
    );
    let build = Scripted::voting("build", Decision::Approve, 0.95);
    let seen = build.seen_upstream();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            market,
            Scripted::voting("tech", Decision::Approve, 0.85),
            Scripted::voting("finance", Decision::Approve, 0.88),
            build,
        ]),
    );

    let report = coordinator
        .run(
            &pipeline(temp.path(), yaml),
            &policies("accept_single_source: true"),
            cancellation().1,
        )
        .await
        .unwrap();

    assert_eq!(report.run.state, RunState::Completed);
    let review = &report.summary.checkpoints[0];
    assert_eq!(review.consensus, Decision::Approve);
    assert!((review.aggregate_confidence - 0.8767).abs() < 1e-3);
    assert!(!review.needs_escalation);
    assert_eq!(review.state, CheckpointState::Continue);
    assert_eq!(*seen.lock().unwrap(), vec![json!({"plan": "b2b"})]);
}

#[tokio::test]
async fn test_parallel_group_timeout_becomes_skip_record() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: slow
steps:
  - group: review
    stages:
      - name: fast_a
      - name: fast_b
      - name: laggard
        timeout_seconds: 1
"#;

    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("fast_a", Decision::Approve, 0.9),
            Scripted::voting("fast_b", Decision::Approve, 0.85),
            Scripted::voting("laggard", Decision::Reject, 0.9).with_delay(Duration::from_secs(30)),
        ]),
    );
    let policies = policies("escalation: { default_action: proceed_conditionally }");

    let started = Instant::now();
    let report = coordinator
        .run(&pipeline(temp.path(), yaml), &policies, cancellation().1)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let laggard = report.summary.stage("laggard").unwrap();
    assert_eq!(laggard.outcome, "timed_out");
    assert_eq!(laggard.decision, Decision::Skip);
    assert_eq!(laggard.flags, vec![FLAG_TIMEOUT.to_string()]);

    // (0.9 + 0.85 + 0.0) / 3 falls below the minimum
    let review = &report.summary.checkpoints[0];
    assert_eq!(review.consensus, Decision::Approve);
    assert!(review.needs_escalation);
    assert_eq!(review.action.as_deref(), Some("proceed_conditionally"));
    assert_eq!(report.run.state, RunState::Completed);

    let entries = AuditLog::replay_run(coordinator.runs_dir(), report.run.id)
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.event_type == AuditEventType::StageTimedOut
        && e.stage_id.as_deref() == Some("laggard")));
}

#[tokio::test]
async fn test_cancellation_aggregates_partial_group_and_halts() {
    let temp = TempDir::new().unwrap();
    let slow_a = Scripted::voting("optimist", Decision::Approve, 0.9).with_delay(Duration::from_secs(30));
    let slow_b = Scripted::voting("skeptic", Decision::Reject, 0.9).with_delay(Duration::from_secs(30));
    let build = Scripted::voting("build", Decision::Approve, 0.9);
    let build_calls = build.calls();
    let coordinator = coordinator(temp.path(), registry(vec![slow_a, slow_b, build]));

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let report = coordinator
        .run(
            &pipeline(temp.path(), REVIEW_THEN_BUILD),
            &PolicySet::default(),
            signal,
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(matches!(report.run.state, RunState::Halted { .. }));
    assert_eq!(report.summary.checkpoints.len(), 1);
    assert_eq!(report.summary.checkpoints[0].state, CheckpointState::Halted);
    for stage in ["optimist", "skeptic"] {
        let row = report.summary.stage(stage).unwrap();
        assert_eq!(row.outcome, "cancelled");
        assert_eq!(row.flags, vec![FLAG_CANCELLED.to_string()]);
    }
    assert_eq!(calls(&build_calls), 0);

    let entries = AuditLog::replay_run(coordinator.runs_dir(), report.run.id)
        .await
        .unwrap();
    let types: Vec<AuditEventType> = entries.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&AuditEventType::CheckpointAggregated));
    assert_eq!(types.last(), Some(&AuditEventType::RunHalted));
}

#[tokio::test]
async fn test_hard_block_without_action_halts() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: budget
steps:
  - group: review
    stages:
      - name: market
      - name: finance
      - name: tech
"#;

    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("market", Decision::Approve, 0.9),
            Scripted::answering(
                "finance",
                StageResult::new(Decision::Reject, "too expensive", 0.85).with_flag("budget_exceeded"),
            ),
            Scripted::answering(
                "tech",
                StageResult::new(Decision::Conditional, "doable", 0.75).with_flag("complexity_risk"),
            ),
        ]),
    );

    let report = coordinator
        .run(
            &pipeline(temp.path(), yaml),
            &policies("hard_block_flags: [budget_exceeded]"),
            cancellation().1,
        )
        .await
        .unwrap();

    assert!(matches!(report.run.state, RunState::Halted { .. }));
    let review = &report.summary.checkpoints[0];
    assert!(review.needs_escalation);
    assert_eq!(review.state, CheckpointState::Halted);
    assert_eq!(
        review.flagged_concerns,
        vec!["budget_exceeded".to_string(), "complexity_risk".to_string()]
    );
    assert!(review.escalation_reasons.iter().any(|r| r.contains("budget_exceeded")));
}

#[tokio::test]
async fn test_disagreement_alone_pauses_checkpoint() {
    let temp = TempDir::new().unwrap();
    let build = Scripted::voting("build", Decision::Approve, 0.9);
    let build_calls = build.calls();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("optimist", Decision::Approve, 0.9),
            Scripted::voting("skeptic", Decision::Reject, 0.85),
            build,
        ]),
    );

    let report = coordinator
        .run(
            &pipeline(temp.path(), REVIEW_THEN_BUILD),
            &PolicySet::default(),
            cancellation().1,
        )
        .await
        .unwrap();

    assert!(matches!(report.run.state, RunState::Paused { checkpoint: 0, .. }));
    assert_eq!(calls(&build_calls), 0);
    let review = &report.summary.checkpoints[0];
    assert_eq!(review.consensus, Decision::Approve);
    assert!(review.flagged_concerns.is_empty());
    assert_eq!(review.escalation_reasons.len(), 1);
    assert!(review.escalation_reasons[0].starts_with("disagreement between approve/reject"));
    assert_eq!(review.action.as_deref(), Some("await_confirmation"));
}

#[tokio::test]
async fn test_pause_then_resume_with_approval() {
    let temp = TempDir::new().unwrap();
    let optimist = Scripted::answering(
        "optimist",
        StageResult::new(Decision::Approve, "ship it", 0.9).with_payload(json!({"plan": "a"})),
    );
    let optimist_calls = optimist.calls();
    let build = Scripted::voting("build", Decision::Approve, 0.9);
    let build_calls = build.calls();
    let seen = build.seen_upstream();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            optimist,
            Scripted::voting("skeptic", Decision::Reject, 0.85),
            build,
        ]),
    );
    let pipeline = pipeline(temp.path(), REVIEW_THEN_BUILD);
    let policies = policies("accept_single_source: true");

    let paused = coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();

    assert!(matches!(paused.run.state, RunState::Paused { checkpoint: 0, .. }));
    assert_eq!(calls(&build_calls), 0);
    assert_eq!(paused.summary.checkpoints[0].action.as_deref(), Some("await_confirmation"));

    let resumed = coordinator
        .resume(
            paused.run.id,
            &pipeline,
            &policies,
            EscalationResolution::Approve,
            cancellation().1,
        )
        .await
        .unwrap();

    assert_eq!(resumed.run.id, paused.run.id);
    assert_eq!(resumed.run.state, RunState::Completed);
    assert_eq!(calls(&optimist_calls), 1);
    assert_eq!(calls(&build_calls), 1);
    assert_eq!(*seen.lock().unwrap(), vec![json!({"plan": "a"})]);
    assert_eq!(resumed.summary.checkpoints.len(), 2);
    assert_eq!(resumed.summary.checkpoints[0].action.as_deref(), Some("approved"));

    let status = coordinator.status(paused.run.id).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.checkpoint_states.get(&0), Some(&CheckpointState::Escalated));
    assert_eq!(status.checkpoint_states.get(&1), Some(&CheckpointState::Continue));
}

#[tokio::test]
async fn test_resume_with_rejection_halts() {
    let temp = TempDir::new().unwrap();
    let build = Scripted::voting("build", Decision::Approve, 0.9);
    let build_calls = build.calls();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("optimist", Decision::Approve, 0.9),
            Scripted::voting("skeptic", Decision::Reject, 0.85),
            build,
        ]),
    );
    let pipeline = pipeline(temp.path(), REVIEW_THEN_BUILD);
    let policies = PolicySet::default();

    let paused = coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();
    let rejected = coordinator
        .resume(
            paused.run.id,
            &pipeline,
            &policies,
            EscalationResolution::Reject,
            cancellation().1,
        )
        .await
        .unwrap();

    assert!(matches!(rejected.run.state, RunState::Halted { .. }));
    assert_eq!(calls(&build_calls), 0);

    // Only paused runs can be resumed
    let again = coordinator
        .resume(
            paused.run.id,
            &pipeline,
            &policies,
            EscalationResolution::Approve,
            cancellation().1,
        )
        .await;
    let err = again.unwrap_err();
    assert!(err.to_string().contains("already finished"), "unexpected error: {:#}", err);
}

#[tokio::test]
async fn test_escalation_handler_confirms_inline() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("optimist", Decision::Approve, 0.9),
            Scripted::voting("skeptic", Decision::Reject, 0.85),
            Scripted::voting("build", Decision::Approve, 0.9),
        ]),
    )
    .with_escalation_handler(Arc::new(Answer(EscalationResolution::Approve)));

    let report = coordinator
        .run(
            &pipeline(temp.path(), REVIEW_THEN_BUILD),
            &policies("accept_single_source: true"),
            cancellation().1,
        )
        .await
        .unwrap();

    assert_eq!(report.run.state, RunState::Completed);
    let entries = AuditLog::replay_run(coordinator.runs_dir(), report.run.id)
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.event_type == AuditEventType::EscalationResolved));
}

#[tokio::test]
async fn test_unanswered_escalation_applies_on_timeout() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(
        temp.path(),
        registry(vec![
            Scripted::voting("optimist", Decision::Approve, 0.9),
            Scripted::voting("skeptic", Decision::Reject, 0.85),
            Scripted::voting("build", Decision::Approve, 0.9),
        ]),
    )
    .with_escalation_handler(Arc::new(Silent));

    let report = coordinator
        .run(
            &pipeline(temp.path(), REVIEW_THEN_BUILD),
            &policies("escalation: { timeout_seconds: 1, on_timeout: halt }"),
            cancellation().1,
        )
        .await
        .unwrap();

    assert!(matches!(report.run.state, RunState::Halted { .. }));
}

#[tokio::test]
async fn test_invalid_collaborator_result_fails_the_run() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: broken
steps:
  - name: overconfident
"#;
    let bad = StageResult {
        decision: "approve".to_string(),
        reasoning: "certain".to_string(),
        confidence: 1.5,
        flags: Vec::new(),
        payload: json!(null),
        metadata: Default::default(),
    };
    let coordinator = coordinator(temp.path(), registry(vec![Scripted::answering("overconfident", bad)]));

    let err = coordinator
        .run(&pipeline(temp.path(), yaml), &PolicySet::default(), cancellation().1)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());

    let runs = coordinator.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(matches!(runs[0].state, RunState::Failed { .. }));

    let entries = AuditLog::replay_run(coordinator.runs_dir(), runs[0].id)
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.event_type == AuditEventType::RecordRejected));
    assert!(coordinator.cache().stats().await.unwrap().total == 0);
}

#[tokio::test]
async fn test_unknown_policy_phase_fails_before_any_stage() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: phased
steps:
  - name: research
    phase: launch
"#;
    let stage = Scripted::voting("research", Decision::Approve, 0.9);
    let counter = stage.calls();
    let coordinator = coordinator(temp.path(), registry(vec![stage]));

    let result = coordinator
        .run(&pipeline(temp.path(), yaml), &PolicySet::default(), cancellation().1)
        .await;

    assert!(result.is_err());
    assert_eq!(calls(&counter), 0);
    assert!(coordinator.list_runs(10).await.unwrap().is_empty());
}
