//! Coordinator loop driving a pipeline through its checkpoints.
//!
//! For each checkpoint the coordinator checks the cache for every member
//! stage, runs the misses concurrently under per-stage timeouts, turns every
//! slot into a well-formed record and aggregates them. The consensus decides
//! whether the run continues, escalates or halts. Every transition is
//! appended to the run's audit log before the coordinator moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    EscalationHandler, EscalationRequest, EscalationResolution, Stage, StageContext, StageRegistry,
};
use crate::domain::{
    AuditEntry, AuditEventType, CacheStatus, CheckpointState, CheckpointSummary, OutputRecord,
    Run, RunState, RunSummary, StageOutcome, StageResult, StageSummary, FLAG_CANCELLED,
    FLAG_STAGE_DISABLED, FLAG_STAGE_ERROR, FLAG_STAGE_UNAVAILABLE, FLAG_TIMEOUT,
};

use super::aggregation::{aggregate, AggregationResult};
use super::audit_log::AuditLog;
use super::cache::{hash_inputs, CacheLookup, CacheStore};
use super::inputs::{resolve_inputs, DeclaredInput};
use super::pipeline::{Pipeline, PipelineStep, StageSpec};
use super::policy::{EscalationAction, EscalationConfig, PolicySet, TimeoutAction};

/// Create a linked cancellation handle and signal
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Triggers cancellation of a run
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers may already be gone once the run finished
        let _ = self.tx.send(true);
    }
}

/// Observes cancellation; cheap to clone into stage tasks
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Final state of a run plus its summary artifact
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    pub summary: RunSummary,
}

/// Hands out record timestamps that never go backwards within a run
#[derive(Debug)]
struct RunClock {
    last: DateTime<Utc>,
}

impl RunClock {
    fn new() -> Self {
        Self { last: Utc::now() }
    }

    fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now().max(self.last);
        self.last = now;
        now
    }
}

/// Mutable state of one coordinator pass
struct Execution<'a> {
    log: AuditLog,
    run: Run,
    summary: RunSummary,
    clock: RunClock,
    pipeline: &'a Pipeline,
    policies: &'a PolicySet,
    cancel: CancelSignal,
}

impl Execution<'_> {
    fn entry(&self, event_type: AuditEventType, summary: impl Into<String>) -> AuditEntry {
        AuditEntry::new(self.run.id, event_type, summary)
    }

    /// Append an entry and fold it into the in-memory run
    async fn record(&mut self, entry: AuditEntry) -> Result<()> {
        self.log.append(&entry).await?;
        self.run.apply_entry(&entry);
        Ok(())
    }

    /// Skip record for a slot with no real result
    fn synthesize(&mut self, stage_id: &str, reason: &str, flag: &str) -> Result<OutputRecord> {
        let record = OutputRecord::skip_record_flagged(stage_id, reason, flag)?;
        Ok(record.with_timestamp(self.clock.now()))
    }

    async fn continue_at(
        &mut self,
        checkpoint: usize,
        payload: &Value,
        action: Option<EscalationAction>,
    ) -> Result<()> {
        let entry = self
            .entry(
                AuditEventType::CheckpointContinued,
                format!("Checkpoint {} passed", checkpoint),
            )
            .at_checkpoint(checkpoint)
            .with_details(json!({
                "payload": payload,
                "action": action.map(|a| a.as_str()),
            }));
        self.record(entry).await
    }

    async fn resolved(&mut self, checkpoint: usize, resolution: &str) -> Result<()> {
        let entry = self
            .entry(
                AuditEventType::EscalationResolved,
                format!("Escalation at checkpoint {} resolved: {}", checkpoint, resolution),
            )
            .at_checkpoint(checkpoint)
            .with_details(json!({ "resolution": resolution }));
        self.record(entry).await
    }

    async fn pause(&mut self, checkpoint: usize, reason: String, payload: &Value) -> Result<()> {
        info!(run_id = %self.run.id, checkpoint, %reason, "Run paused awaiting confirmation");
        let entry = self
            .entry(AuditEventType::RunPaused, reason)
            .at_checkpoint(checkpoint)
            .with_details(json!({ "payload": payload }));
        self.record(entry).await
    }

    async fn halt(&mut self, checkpoint: Option<usize>, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        warn!(run_id = %self.run.id, ?checkpoint, %reason, "Run halted");
        let mut entry = self
            .entry(AuditEventType::RunHalted, format!("Run halted: {}", reason))
            .with_error(reason);
        if let Some(idx) = checkpoint {
            entry = entry.at_checkpoint(idx);
        }
        self.record(entry).await
    }

    async fn complete(&mut self) -> Result<()> {
        info!(run_id = %self.run.id, "Run completed");
        let entry = self.entry(
            AuditEventType::RunCompleted,
            format!("Pipeline '{}' completed", self.pipeline.name),
        );
        self.record(entry).await
    }
}

/// One stage slot while its checkpoint is in flight
struct Slot<'p> {
    spec: &'p StageSpec,
    cache: CacheStatus,
    digest: Option<String>,
    outcome: Option<StageOutcome>,
}

/// Work handed to a spawned stage task
struct Pending {
    slot: usize,
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    timeout: Duration,
}

/// How a spawned invocation ended
enum Invocation {
    Returned(StageResult),
    Errored(String),
    TimedOut(Duration),
    Cancelled,
}

/// How an awaited confirmation ended
enum Confirmation {
    Resolved(EscalationResolution),
    Unanswered,
    Cancelled,
}

/// Pipeline coordinator
pub struct Coordinator {
    registry: StageRegistry,
    cache: CacheStore,
    runs_dir: PathBuf,
    escalation_handler: Option<Arc<dyn EscalationHandler>>,
}

impl Coordinator {
    pub fn new(registry: StageRegistry, cache: CacheStore, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cache,
            runs_dir: runs_dir.into(),
            escalation_handler: None,
        }
    }

    /// Confirm escalations through `handler` instead of pausing
    pub fn with_escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation_handler = Some(handler);
        self
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Execute a pipeline from its first checkpoint
    #[instrument(skip(self, pipeline, policies, cancel), fields(pipeline = %pipeline.name))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        policies: &PolicySet,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        preflight(pipeline, policies)?;

        let run_id = Uuid::new_v4();
        info!(%run_id, checkpoints = pipeline.steps.len(), "Starting run");

        let log = AuditLog::open(&self.runs_dir, run_id).await?;
        let mut exec = Execution {
            log,
            run: Run::new(run_id, pipeline.name.clone()),
            summary: RunSummary::new(run_id, pipeline.name.clone()),
            clock: RunClock::new(),
            pipeline,
            policies,
            cancel,
        };

        let start = exec
            .entry(
                AuditEventType::RunStarted,
                format!("Pipeline '{}' started", pipeline.name),
            )
            .with_details(json!({
                "pipeline": pipeline.name,
                "checkpoints": pipeline.steps.len(),
            }));
        exec.record(start).await?;

        let outcome = self.drive(&mut exec, 0, Value::Null).await;
        self.settle(exec, outcome).await
    }

    /// Continue or halt a run paused at an escalated checkpoint
    #[instrument(skip(self, pipeline, policies, cancel), fields(pipeline = %pipeline.name))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        pipeline: &Pipeline,
        policies: &PolicySet,
        resolution: EscalationResolution,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        preflight(pipeline, policies)?;

        let log = AuditLog::open(&self.runs_dir, run_id).await?;
        let entries = log.replay().await?;
        let run = Run::from_entries(&entries)
            .with_context(|| format!("Run {} not found", run_id))?;

        if run.is_finished() {
            anyhow::bail!("Run {} has already finished (state: {:?})", run_id, run.state);
        }
        let checkpoint = match run.state {
            RunState::Paused { checkpoint, .. } => checkpoint,
            ref other => anyhow::bail!("Run {} is not paused (state: {:?})", run_id, other),
        };
        if run.pipeline_name != pipeline.name {
            anyhow::bail!(
                "Run {} belongs to pipeline '{}', not '{}'",
                run_id,
                run.pipeline_name,
                pipeline.name
            );
        }
        if checkpoint >= pipeline.steps.len() {
            anyhow::bail!(
                "Run {} paused at checkpoint {} but pipeline '{}' has {} checkpoints",
                run_id,
                checkpoint,
                pipeline.name,
                pipeline.steps.len()
            );
        }

        info!(%run_id, checkpoint, ?resolution, "Resuming run");

        let summary = AuditLog::read_summary(&self.runs_dir, run_id)
            .await?
            .unwrap_or_else(|| RunSummary::new(run_id, pipeline.name.clone()));
        let payload = run.forwarded_payload.clone();

        let mut exec = Execution {
            log,
            run,
            summary,
            clock: RunClock::new(),
            pipeline,
            policies,
            cancel,
        };

        let resumed = exec
            .entry(AuditEventType::RunResumed, format!("Run resumed: {:?}", resolution))
            .at_checkpoint(checkpoint);
        exec.record(resumed).await?;

        let outcome = self
            .apply_resolution(&mut exec, checkpoint, resolution, payload)
            .await;
        self.settle(exec, outcome).await
    }

    async fn apply_resolution(
        &self,
        exec: &mut Execution<'_>,
        checkpoint: usize,
        resolution: EscalationResolution,
        payload: Value,
    ) -> Result<()> {
        match resolution {
            EscalationResolution::Approve => {
                set_checkpoint_action(&mut exec.summary, checkpoint, "approved", None);
                exec.resolved(checkpoint, "approved").await?;
                exec.continue_at(checkpoint, &payload, Some(EscalationAction::AwaitConfirmation))
                    .await?;
                self.drive(exec, checkpoint + 1, payload).await
            }
            EscalationResolution::Reject => {
                set_checkpoint_action(
                    &mut exec.summary,
                    checkpoint,
                    "rejected",
                    Some(CheckpointState::Halted),
                );
                exec.resolved(checkpoint, "rejected").await?;
                exec.halt(Some(checkpoint), "Escalation rejected by operator").await
            }
        }
    }

    /// Reconstruct a run from its audit log
    pub async fn status(&self, run_id: Uuid) -> Result<Run> {
        let entries = AuditLog::replay_run(&self.runs_dir, run_id).await?;
        Run::from_entries(&entries).with_context(|| format!("Run {} not found", run_id))
    }

    /// Summary written for a run, if any
    pub async fn summary(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        AuditLog::read_summary(&self.runs_dir, run_id).await
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let run_ids = AuditLog::list_runs(&self.runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match self.status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }

    /// Walk checkpoints from `start` until the run completes, pauses or halts
    async fn drive<'p>(
        &self,
        exec: &mut Execution<'p>,
        start: usize,
        mut upstream: Value,
    ) -> Result<()> {
        let pipeline = exec.pipeline;
        let policies = exec.policies;

        for (idx, step) in pipeline.steps.iter().enumerate().skip(start) {
            if exec.cancel.is_cancelled() {
                return exec.halt(None, "Run cancelled").await;
            }

            let policy = policies.for_phase(step.phase())?;
            info!(checkpoint = idx, name = step.name(), stages = step.members().len(), "Entering checkpoint");

            let outcomes = self.run_checkpoint(exec, idx, step, &upstream).await?;
            let records: Vec<OutputRecord> = outcomes
                .into_iter()
                .map(StageOutcome::into_record)
                .collect();

            let result = aggregate(&records, policy)?;
            let payload = result.winning_payload(&records);

            info!(
                checkpoint = idx,
                consensus = %result.consensus_decision,
                confidence = result.aggregate_confidence,
                escalate = result.needs_escalation,
                "Checkpoint aggregated"
            );
            let aggregated = exec
                .entry(
                    AuditEventType::CheckpointAggregated,
                    format!(
                        "Checkpoint '{}' aggregated to {} ({:.3})",
                        step.name(),
                        result.consensus_decision,
                        result.aggregate_confidence
                    ),
                )
                .at_checkpoint(idx)
                .with_details(serde_json::to_value(&result)?);
            exec.record(aggregated).await?;

            let mut row = checkpoint_row(idx, step.name(), &result);

            if exec.cancel.is_cancelled() {
                row.state = CheckpointState::Halted;
                exec.summary.checkpoints.push(row);
                return exec.halt(Some(idx), "Run cancelled").await;
            }

            if !result.needs_escalation {
                row.state = CheckpointState::Continue;
                exec.summary.checkpoints.push(row);
                exec.continue_at(idx, &payload, None).await?;
                upstream = payload;
                continue;
            }

            let reasons = result
                .escalation_reasons
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            let action = policy.escalation.action_for(result.has_hard_block());

            warn!(checkpoint = idx, %reasons, action = ?action, "Checkpoint escalated");
            let raised = exec
                .entry(
                    AuditEventType::EscalationRaised,
                    format!("Checkpoint '{}' escalated: {}", step.name(), reasons),
                )
                .at_checkpoint(idx)
                .with_details(json!({
                    "reasons": result.escalation_reasons,
                    "action": action.map(|a| a.as_str()),
                }));
            exec.record(raised).await?;

            row.state = CheckpointState::Escalated;
            row.action = Some(action.unwrap_or(EscalationAction::Halt).as_str().to_string());

            match action {
                Some(EscalationAction::ProceedConditionally) => {
                    exec.summary.checkpoints.push(row);
                    exec.continue_at(idx, &payload, action).await?;
                    upstream = payload;
                }
                None | Some(EscalationAction::Halt) => {
                    row.state = CheckpointState::Halted;
                    exec.summary.checkpoints.push(row);
                    return exec
                        .halt(Some(idx), format!("Checkpoint '{}' escalated: {}", step.name(), reasons))
                        .await;
                }
                Some(EscalationAction::AwaitConfirmation) => {
                    let Some(handler) = self.escalation_handler.clone() else {
                        exec.summary.checkpoints.push(row);
                        return exec.pause(idx, reasons, &payload).await;
                    };

                    let request = EscalationRequest {
                        run_id: exec.run.id,
                        checkpoint: idx,
                        checkpoint_name: step.name().to_string(),
                        result: result.clone(),
                    };
                    let answer =
                        await_confirmation(handler, &request, &policy.escalation, exec.cancel.clone())
                            .await;

                    let proceed = match answer {
                        Confirmation::Resolved(EscalationResolution::Approve) => {
                            exec.resolved(idx, "approved").await?;
                            true
                        }
                        Confirmation::Resolved(EscalationResolution::Reject) => {
                            exec.resolved(idx, "rejected").await?;
                            false
                        }
                        Confirmation::Unanswered => {
                            let proceed = policy.escalation.on_timeout == TimeoutAction::Proceed;
                            exec.resolved(idx, if proceed { "timeout_proceed" } else { "timeout_halt" })
                                .await?;
                            proceed
                        }
                        Confirmation::Cancelled => {
                            row.state = CheckpointState::Halted;
                            exec.summary.checkpoints.push(row);
                            return exec.halt(Some(idx), "Run cancelled").await;
                        }
                    };

                    if !proceed {
                        row.state = CheckpointState::Halted;
                        exec.summary.checkpoints.push(row);
                        return exec
                            .halt(Some(idx), format!("Escalation at '{}' not confirmed", step.name()))
                            .await;
                    }

                    exec.summary.checkpoints.push(row);
                    exec.continue_at(idx, &payload, action).await?;
                    upstream = payload;
                }
            }
        }

        exec.complete().await
    }

    /// Produce one outcome per member stage, in declared order
    async fn run_checkpoint<'p>(
        &self,
        exec: &mut Execution<'p>,
        idx: usize,
        step: &'p PipelineStep,
        upstream: &Value,
    ) -> Result<Vec<StageOutcome>> {
        let pipeline = exec.pipeline;
        let mut slots: Vec<Slot<'p>> = Vec::with_capacity(step.members().len());
        let mut pending = Vec::new();

        // Cache checks happen here, before anything is spawned
        for spec in step.members() {
            let started = exec
                .entry(
                    AuditEventType::StageStarted,
                    format!("Stage '{}' started", spec.name),
                )
                .at_checkpoint(idx)
                .for_stage(&spec.name);
            exec.record(started).await?;

            if !spec.enabled {
                let record = exec.synthesize(&spec.name, "Stage is disabled", FLAG_STAGE_DISABLED)?;
                let skipped = exec
                    .entry(
                        AuditEventType::StageSkipped,
                        format!("Stage '{}' is disabled", spec.name),
                    )
                    .at_checkpoint(idx)
                    .for_stage(&spec.name);
                exec.record(skipped).await?;
                slots.push(Slot {
                    spec,
                    cache: CacheStatus::Bypassed,
                    digest: None,
                    outcome: Some(StageOutcome::Skipped(record)),
                });
                continue;
            }

            let (inputs, digest) = match digest_for(spec, &pipeline.base_dir, upstream).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(stage = %spec.name, error = %message, "Failed to resolve declared inputs");
                    let record = exec.synthesize(&spec.name, &message, FLAG_STAGE_ERROR)?;
                    let failed = exec
                        .entry(
                            AuditEventType::StageFailed,
                            format!("Stage '{}' inputs could not be resolved", spec.name),
                        )
                        .at_checkpoint(idx)
                        .for_stage(&spec.name)
                        .with_error(message);
                    exec.record(failed).await?;
                    slots.push(Slot {
                        spec,
                        cache: CacheStatus::Bypassed,
                        digest: None,
                        outcome: Some(StageOutcome::Failed(record)),
                    });
                    continue;
                }
            };

            let mut cache_status = CacheStatus::Bypassed;
            if spec.cache {
                let lookup = self.cache.lookup(&spec.name, &digest).await;
                cache_status = lookup.status();

                let details = match lookup {
                    CacheLookup::Hit(record) => {
                        info!(stage = %spec.name, digest = %digest, "Cache hit");
                        let hit = exec
                            .entry(
                                AuditEventType::CacheHit,
                                format!("Stage '{}' served from cache", spec.name),
                            )
                            .at_checkpoint(idx)
                            .for_stage(&spec.name)
                            .with_input_hash(&digest);
                        exec.record(hit).await?;
                        slots.push(Slot {
                            spec,
                            cache: cache_status,
                            digest: Some(digest),
                            outcome: Some(StageOutcome::Cached(record)),
                        });
                        continue;
                    }
                    CacheLookup::Miss => json!({ "status": "miss" }),
                    CacheLookup::Expired { age_seconds } => {
                        json!({ "status": "expired", "age_seconds": age_seconds })
                    }
                    CacheLookup::Corrupt { reason } => {
                        warn!(stage = %spec.name, digest = %digest, %reason, "Corrupt cache entry treated as miss");
                        json!({ "status": "corrupt", "reason": reason })
                    }
                };

                let miss = exec
                    .entry(
                        AuditEventType::CacheMiss,
                        format!("Stage '{}' cache miss", spec.name),
                    )
                    .at_checkpoint(idx)
                    .for_stage(&spec.name)
                    .with_input_hash(&digest)
                    .with_details(details);
                exec.record(miss).await?;
            }

            let Some(stage) = self.registry.get(&spec.name) else {
                warn!(stage = %spec.name, "No collaborator registered");
                let record =
                    exec.synthesize(&spec.name, "No collaborator registered", FLAG_STAGE_UNAVAILABLE)?;
                let skipped = exec
                    .entry(
                        AuditEventType::StageSkipped,
                        format!("Stage '{}' has no collaborator", spec.name),
                    )
                    .at_checkpoint(idx)
                    .for_stage(&spec.name);
                exec.record(skipped).await?;
                slots.push(Slot {
                    spec,
                    cache: cache_status,
                    digest: Some(digest),
                    outcome: Some(StageOutcome::Skipped(record)),
                });
                continue;
            };

            pending.push(Pending {
                slot: slots.len(),
                stage,
                ctx: StageContext {
                    run_id: exec.run.id,
                    stage_id: spec.name.clone(),
                    inputs,
                    upstream: upstream.clone(),
                    input_hash: digest.clone(),
                },
                timeout: pipeline.timeout_for(spec),
            });
            slots.push(Slot {
                spec,
                cache: cache_status,
                digest: Some(digest),
                outcome: None,
            });
        }

        // Spawned tasks only execute; recording stays on this task
        let mut tasks = JoinSet::new();
        for job in pending {
            let cancel = exec.cancel.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let invocation = invoke(job.stage, job.ctx, job.timeout, cancel).await;
                (job.slot, invocation, started.elapsed())
            });
        }

        let mut finished: Vec<Option<(Invocation, Duration)>> =
            (0..slots.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, invocation, elapsed)) => finished[slot] = Some((invocation, elapsed)),
                Err(e) => error!(checkpoint = idx, error = %e, "Stage task aborted"),
            }
        }

        for i in 0..slots.len() {
            if slots[i].outcome.is_some() {
                continue;
            }
            let spec = slots[i].spec;
            let digest = slots[i].digest.clone().unwrap_or_default();
            let (invocation, elapsed) = finished[i]
                .take()
                .unwrap_or_else(|| (Invocation::Errored("Stage task aborted".to_string()), Duration::ZERO));
            let duration_ms = elapsed.as_millis() as u64;

            let outcome = match invocation {
                Invocation::Returned(result) => {
                    let record = match result.into_record(&spec.name) {
                        Ok(record) => record.with_timestamp(exec.clock.now()),
                        Err(e) => {
                            error!(stage = %spec.name, error = %e, "Stage returned an invalid record");
                            let rejected = exec
                                .entry(
                                    AuditEventType::RecordRejected,
                                    format!("Stage '{}' returned an invalid record", spec.name),
                                )
                                .at_checkpoint(idx)
                                .for_stage(&spec.name)
                                .with_input_hash(&digest)
                                .with_error(e.to_string());
                            exec.record(rejected).await?;
                            return Err(anyhow::Error::new(e)
                                .context(format!("Stage '{}' returned an invalid record", spec.name)));
                        }
                    };

                    if spec.cache {
                        if let Err(e) = self
                            .cache
                            .set(&spec.name, &digest, &record, pipeline.ttl_for(spec))
                            .await
                        {
                            warn!(stage = %spec.name, error = %e, "Failed to write cache entry");
                        }
                    }

                    info!(stage = %spec.name, decision = %record.decision(), duration_ms, "Stage executed");
                    let executed = exec
                        .entry(
                            AuditEventType::StageExecuted,
                            format!("Stage '{}' returned {}", spec.name, record.decision()),
                        )
                        .at_checkpoint(idx)
                        .for_stage(&spec.name)
                        .with_input_hash(&digest)
                        .with_duration(duration_ms)
                        .with_details(json!({
                            "decision": record.decision(),
                            "confidence": record.confidence(),
                            "flags": record.flags(),
                        }));
                    exec.record(executed).await?;
                    StageOutcome::Completed(record)
                }
                Invocation::Errored(message) => {
                    warn!(stage = %spec.name, error = %message, "Stage failed");
                    let record = exec.synthesize(&spec.name, &message, FLAG_STAGE_ERROR)?;
                    let failed = exec
                        .entry(AuditEventType::StageFailed, format!("Stage '{}' failed", spec.name))
                        .at_checkpoint(idx)
                        .for_stage(&spec.name)
                        .with_input_hash(&digest)
                        .with_duration(duration_ms)
                        .with_error(message);
                    exec.record(failed).await?;
                    StageOutcome::Failed(record)
                }
                Invocation::TimedOut(limit) => {
                    let reason = format!("Timed out after {}s", limit.as_secs_f64());
                    warn!(stage = %spec.name, timeout_s = limit.as_secs_f64(), "Stage timed out");
                    let record = exec.synthesize(&spec.name, &reason, FLAG_TIMEOUT)?;
                    let timed_out = exec
                        .entry(
                            AuditEventType::StageTimedOut,
                            format!("Stage '{}' timed out", spec.name),
                        )
                        .at_checkpoint(idx)
                        .for_stage(&spec.name)
                        .with_input_hash(&digest)
                        .with_duration(duration_ms)
                        .with_error(reason);
                    exec.record(timed_out).await?;
                    StageOutcome::TimedOut(record)
                }
                Invocation::Cancelled => {
                    let record = exec.synthesize(&spec.name, "Run cancelled", FLAG_CANCELLED)?;
                    let cancelled = exec
                        .entry(
                            AuditEventType::StageCancelled,
                            format!("Stage '{}' abandoned on cancellation", spec.name),
                        )
                        .at_checkpoint(idx)
                        .for_stage(&spec.name)
                        .with_duration(duration_ms);
                    exec.record(cancelled).await?;
                    StageOutcome::Cancelled(record)
                }
            };
            slots[i].outcome = Some(outcome);
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for slot in slots {
            let Some(outcome) = slot.outcome else { continue };
            let record = outcome.record();
            exec.summary.stages.push(StageSummary {
                checkpoint: idx,
                stage_id: slot.spec.name.clone(),
                cache: slot.cache,
                outcome: outcome.label().to_string(),
                decision: record.decision(),
                confidence: record.confidence(),
                flags: record.flags().iter().cloned().collect(),
            });
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Record a fatal error if needed and write the summary
    async fn settle(&self, mut exec: Execution<'_>, outcome: Result<()>) -> Result<RunReport> {
        if let Err(e) = outcome {
            error!(run_id = %exec.run.id, error = %e, "Run failed");
            let failed = exec
                .entry(AuditEventType::RunFailed, "Run failed")
                .with_error(format!("{:#}", e));
            if let Err(log_err) = exec.record(failed).await {
                warn!(error = %log_err, "Failed to record run failure");
            }
            exec.summary.state = exec.run.state.clone();
            exec.summary.generated_at = Utc::now();
            if let Err(write_err) = exec.log.write_summary(&exec.summary).await {
                warn!(error = %write_err, "Failed to write run summary");
            }
            return Err(e);
        }

        exec.summary.state = exec.run.state.clone();
        exec.summary.generated_at = Utc::now();
        let path = exec.log.write_summary(&exec.summary).await?;
        info!(summary = %path.display(), state = ?exec.run.state, "Run summary written");

        Ok(RunReport {
            run: exec.run,
            summary: exec.summary,
        })
    }
}

/// Reject a run before anything executes if its configuration is unusable
fn preflight(pipeline: &Pipeline, policies: &PolicySet) -> Result<()> {
    pipeline.validate()?;
    for phase in pipeline.phases() {
        policies.for_phase(Some(phase))?;
    }
    Ok(())
}

async fn digest_for(
    spec: &StageSpec,
    base_dir: &Path,
    upstream: &Value,
) -> Result<(Vec<DeclaredInput>, String)> {
    let inputs = resolve_inputs(&spec.inputs, base_dir, upstream)?;
    let digest = hash_inputs(&inputs).await?;
    Ok((inputs, digest))
}

async fn invoke(
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    limit: Duration,
    mut cancel: CancelSignal,
) -> Invocation {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Invocation::Cancelled,
        result = tokio::time::timeout(limit, stage.execute(&ctx)) => match result {
            Ok(Ok(result)) => Invocation::Returned(result),
            Ok(Err(e)) => Invocation::Errored(format!("{:#}", e)),
            Err(_) => Invocation::TimedOut(limit),
        },
    }
}

async fn await_confirmation(
    handler: Arc<dyn EscalationHandler>,
    request: &EscalationRequest,
    config: &EscalationConfig,
    mut cancel: CancelSignal,
) -> Confirmation {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Confirmation::Cancelled,
        answer = tokio::time::timeout(config.timeout(), handler.confirm(request)) => match answer {
            Ok(Ok(resolution)) => Confirmation::Resolved(resolution),
            Ok(Err(e)) => {
                warn!(error = %e, "Escalation handler failed");
                Confirmation::Unanswered
            }
            Err(_) => Confirmation::Unanswered,
        },
    }
}

fn checkpoint_row(index: usize, name: &str, result: &AggregationResult) -> CheckpointSummary {
    CheckpointSummary {
        index,
        name: name.to_string(),
        consensus: result.consensus_decision,
        aggregate_confidence: result.aggregate_confidence,
        needs_escalation: result.needs_escalation,
        escalation_reasons: result
            .escalation_reasons
            .iter()
            .map(ToString::to_string)
            .collect(),
        flagged_concerns: result.flagged_concerns.iter().cloned().collect(),
        state: CheckpointState::Aggregated,
        action: None,
    }
}

fn set_checkpoint_action(
    summary: &mut RunSummary,
    checkpoint: usize,
    action: &str,
    state: Option<CheckpointState>,
) {
    if let Some(row) = summary.checkpoints.iter_mut().rev().find(|c| c.index == checkpoint) {
        row.action = Some(action.to_string());
        if let Some(state) = state {
            row.state = state;
        }
    }
}
