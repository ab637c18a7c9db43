//! Cache Reuse Integration Tests
//!
//! A stage whose declared inputs are unchanged is served from the cache
//! within its TTL and re-executed once the entry expires or an input
//! changes.

mod common;

use std::time::Duration;

use chrono::Utc;
use quorum::core::{cancellation, AuditLog, CacheStore, ConflictPolicy, PolicySet};
use quorum::domain::{AuditEventType, CacheStatus, Decision, RunState, FLAG_STAGE_ERROR};
use tempfile::TempDir;

use common::{calls, coordinator, pipeline, registry, Scripted};

const SINGLE_STAGE: &str = r#"
name: reuse
steps:
  - name: research
    inputs:
      - idea.md
    ttl_seconds: 60
"#;

fn lenient() -> PolicySet {
    PolicySet::single(ConflictPolicy {
        accept_single_source: true,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("idea.md"), "Invoicing for freelancers").unwrap();

    let stage = Scripted::voting("research", Decision::Approve, 0.9);
    let counter = stage.calls();
    let coordinator = coordinator(temp.path(), registry(vec![stage]));
    let pipeline = pipeline(temp.path(), SINGLE_STAGE);
    let policies = lenient();

    let (_handle, signal) = cancellation();
    let first = tokio_test::assert_ok!(coordinator.run(&pipeline, &policies, signal.clone()).await);
    assert_eq!(first.run.state, RunState::Completed);
    assert_eq!(calls(&counter), 1);
    assert_eq!(first.summary.stages[0].cache, CacheStatus::Miss);
    assert_eq!(first.summary.stages[0].outcome, "completed");

    let first_entries = AuditLog::replay_run(coordinator.runs_dir(), first.run.id)
        .await
        .unwrap();
    let digest = first_entries
        .iter()
        .find(|e| e.event_type == AuditEventType::StageExecuted)
        .and_then(|e| e.input_hash.clone())
        .unwrap();
    let stored = coordinator.cache().get("research", &digest).await.unwrap();
    assert_eq!(stored.stage_id(), "research");
    assert_eq!(stored.decision(), Decision::Approve);
    assert_eq!(stored.payload(), &serde_json::json!({ "from": "research" }));

    let second = tokio_test::assert_ok!(coordinator.run(&pipeline, &policies, signal).await);
    assert_eq!(second.run.state, RunState::Completed);
    assert_eq!(calls(&counter), 1, "cached stage must not execute again");
    assert_eq!(second.summary.stages[0].cache, CacheStatus::Hit);
    assert_eq!(second.summary.stages[0].outcome, "cached");
    let served = &second.summary.stages[0];
    assert_eq!(served.decision, stored.decision());
    assert_eq!(served.confidence, stored.confidence());
    let stored_flags: Vec<String> = stored.flags().iter().cloned().collect();
    assert_eq!(served.flags, stored_flags);
    // The entry is untouched by the cached run
    let after = coordinator.cache().get("research", &digest).await.unwrap();
    assert_eq!(after, stored);
    assert_eq!(second.summary.cache_hits(), 1);

    let entries = AuditLog::replay_run(coordinator.runs_dir(), second.run.id)
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.event_type == AuditEventType::CacheHit));
    assert!(!entries.iter().any(|e| e.event_type == AuditEventType::StageExecuted));
}

#[tokio::test]
async fn test_changed_input_invalidates_cache() {
    let temp = TempDir::new().unwrap();
    let idea = temp.path().join("idea.md");
    std::fs::write(&idea, "Invoicing for freelancers").unwrap();

    let stage = Scripted::voting("research", Decision::Approve, 0.9);
    let counter = stage.calls();
    let coordinator = coordinator(temp.path(), registry(vec![stage]));
    let pipeline = pipeline(temp.path(), SINGLE_STAGE);
    let policies = lenient();

    coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();
    std::fs::write(&idea, "Invoicing for agencies").unwrap();
    let second = coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();

    assert_eq!(calls(&counter), 2);
    assert_eq!(second.summary.stages[0].cache, CacheStatus::Miss);
}

#[tokio::test]
async fn test_expired_entry_is_re_executed() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("idea.md"), "Invoicing for freelancers").unwrap();

    let stage = Scripted::voting("research", Decision::Approve, 0.9);
    let counter = stage.calls();
    let coordinator = coordinator(temp.path(), registry(vec![stage]));
    let pipeline = pipeline(temp.path(), SINGLE_STAGE);
    let policies = lenient();

    let first = coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();

    // Backdate the entry past its 60s TTL
    let entries = AuditLog::replay_run(coordinator.runs_dir(), first.run.id)
        .await
        .unwrap();
    let digest = entries
        .iter()
        .find(|e| e.event_type == AuditEventType::StageExecuted)
        .and_then(|e| e.input_hash.clone())
        .unwrap();
    let record = coordinator.cache().get("research", &digest).await.unwrap();
    coordinator
        .cache()
        .set_at(
            "research",
            &digest,
            &record,
            Duration::from_secs(60),
            Utc::now() - chrono::Duration::seconds(61),
        )
        .await
        .unwrap();

    let second = coordinator
        .run(&pipeline, &policies, cancellation().1)
        .await
        .unwrap();

    assert_eq!(calls(&counter), 2);
    assert_eq!(second.summary.stages[0].cache, CacheStatus::Expired);
    assert_eq!(second.summary.stages[0].outcome, "completed");
}

#[tokio::test]
async fn test_synthesized_records_are_never_cached() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
name: flaky
steps:
  - group: review
    stages:
      - name: crashes
      - name: disabled
        enabled: false
      - name: orphan
"#;

    let coordinator = coordinator(temp.path(), registry(vec![Scripted::failing("crashes")]));
    let pipeline = pipeline(temp.path(), yaml);
    let report = coordinator
        .run(&pipeline, &lenient(), cancellation().1)
        .await
        .unwrap();

    let crashes = report.summary.stage("crashes").unwrap();
    assert_eq!(crashes.outcome, "failed");
    assert_eq!(crashes.flags, vec![FLAG_STAGE_ERROR.to_string()]);
    assert_eq!(report.summary.stage("disabled").unwrap().cache, CacheStatus::Bypassed);
    assert_eq!(report.summary.stage("orphan").unwrap().flags, vec!["stage_unavailable".to_string()]);

    let stats = CacheStore::new(temp.path().join("cache")).stats().await.unwrap();
    assert_eq!(stats.total, 0);
}
