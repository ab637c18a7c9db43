//! Command-line interface for quorum.
//!
//! Provides commands for running pipelines, resuming paused runs,
//! inspecting run state, managing the cache and checking policies.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{EscalationResolution, StageRegistry};
use crate::config;
use crate::core::{cancellation, CacheStore, Coordinator, Pipeline, PolicySet, RunReport};
use crate::domain::{RunState, RunSummary};

/// quorum - Cache-aware stage coordinator with weighted-vote consensus
#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (looks in the pipelines directory) or path to a YAML file
        pipeline: String,

        /// Conflict policy file (defaults to the configured policy path)
        #[arg(short, long, env = "QUORUM_POLICY")]
        policy: Option<PathBuf>,
    },

    /// Resume a run paused at an escalated checkpoint
    Resume {
        /// Run ID (UUID)
        run_id: String,

        /// Confirm the escalation and continue
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,

        /// Reject the escalation and halt
        #[arg(long)]
        reject: bool,

        /// Pipeline file, if it is not in the pipelines directory
        #[arg(long)]
        pipeline: Option<String>,

        /// Conflict policy file (defaults to the configured policy path)
        #[arg(short, long, env = "QUORUM_POLICY")]
        policy: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Inspect or clear the stage cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Validate conflict policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Count cache entries
    Stats,

    /// Remove cache entries
    Clear {
        /// Only clear entries for this stage
        #[arg(short, long)]
        stage: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Load and validate a policy file
    Check {
        /// Policy file
        file: PathBuf,

        /// Show the merged policy for this phase
        #[arg(long)]
        phase: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { pipeline, policy } => run_pipeline(&pipeline, policy).await,
            Commands::Resume {
                run_id,
                approve,
                reject: _,
                pipeline,
                policy,
            } => {
                let resolution = if approve {
                    EscalationResolution::Approve
                } else {
                    EscalationResolution::Reject
                };
                resume_run(&run_id, resolution, pipeline, policy).await
            }
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Cache { command } => match command {
                CacheCommands::Stats => cache_stats().await,
                CacheCommands::Clear { stage } => cache_clear(stage).await,
            },
            Commands::Policy { command } => match command {
                PolicyCommands::Check { file, phase } => check_policy(&file, phase.as_deref()),
            },
            Commands::Config => show_config(),
        }
    }
}

/// Run a pipeline from its first checkpoint
async fn run_pipeline(name: &str, policy: Option<PathBuf>) -> Result<()> {
    let pipeline = load_pipeline(name)?;
    let policies = load_policies(policy)?;
    let coordinator = coordinator_for(&pipeline)?;

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling run...]");
            handle.cancel();
        }
    });

    let report = coordinator.run(&pipeline, &policies, signal).await?;
    report_outcome(&report, "completed")
}

/// Resume a paused run with an operator decision
async fn resume_run(
    run_id_str: &str,
    resolution: EscalationResolution,
    pipeline_override: Option<String>,
    policy: Option<PathBuf>,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    // Look up the run to find its pipeline
    let runs_dir = config::runs_dir()?;
    let reader = Coordinator::new(StageRegistry::new(), CacheStore::open_default()?, &runs_dir);
    let existing = reader.status(run_id).await?;

    let pipeline = load_pipeline(pipeline_override.as_deref().unwrap_or(&existing.pipeline_name))?;
    let policies = load_policies(policy)?;
    let coordinator = coordinator_for(&pipeline)?;

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling run...]");
            handle.cancel();
        }
    });

    let report = coordinator
        .resume(run_id, &pipeline, &policies, resolution, signal)
        .await?;
    report_outcome(&report, "resumed and completed")
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let coordinator = Coordinator::new(
        StageRegistry::new(),
        CacheStore::open_default()?,
        config::runs_dir()?,
    );
    let run = coordinator.status(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {}", state_label(&run.state));
    match &run.state {
        RunState::Paused { checkpoint, reason } => {
            println!("Paused at checkpoint {}: {}", checkpoint, reason)
        }
        RunState::Halted { reason } => println!("Reason: {}", reason),
        RunState::Failed { error } => println!("Error: {}", error),
        _ => {}
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Stopped: {}", completed);
    }
    println!("Next checkpoint: {}", run.next_checkpoint);
    println!("\nStage states:");
    for (stage, state) in &run.stage_states {
        println!("  {}: {:?}", stage, state);
    }
    println!("\nCheckpoint states:");
    for (idx, state) in &run.checkpoint_states {
        println!("  {}: {:?}", idx, state);
    }

    if let Some(summary) = coordinator.summary(run_id).await? {
        println!();
        print_summary(&summary);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let coordinator = Coordinator::new(
        StageRegistry::new(),
        CacheStore::open_default()?,
        config::runs_dir()?,
    );
    let runs = coordinator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<15}", "RUN ID", "PIPELINE", "STATE");
    println!("{}", "-".repeat(75));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<15}",
            run.id,
            run.pipeline_name,
            state_label(&run.state)
        );
    }

    Ok(())
}

async fn cache_stats() -> Result<()> {
    let cache = CacheStore::open_default()?;
    let stats = cache.stats().await?;

    println!("Cache: {}", cache.root().display());
    println!("  Entries: {}", stats.total);
    println!("  Valid:   {}", stats.valid);
    println!("  Expired: {}", stats.expired);
    println!("  Corrupt: {}", stats.corrupt);

    Ok(())
}

async fn cache_clear(stage: Option<String>) -> Result<()> {
    let cache = CacheStore::open_default()?;
    let removed = cache.clear(stage.as_deref()).await?;

    match stage {
        Some(stage) => println!("Removed {} cache entries for stage '{}'", removed, stage),
        None => println!("Removed {} cache entries", removed),
    }

    Ok(())
}

fn check_policy(file: &Path, phase: Option<&str>) -> Result<()> {
    let policies = PolicySet::from_file(file)?;
    let policy = policies.for_phase(phase)?;

    println!("Policy OK: {}", file.display());
    let phases: Vec<&str> = policies.phase_names().collect();
    if !phases.is_empty() {
        println!("Phases: {}", phases.join(", "));
    }
    println!();
    print!(
        "{}",
        serde_yaml::to_string(policy).context("Failed to render policy")?
    );

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Quorum Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Runs:      {}", cfg.runs_dir().display());
    println!("  Cache:     {}", cfg.cache.display());
    println!("  Pipelines: {}", cfg.pipelines.display());
    println!(
        "  Policy:    {}{}",
        cfg.policy.display(),
        if cfg.policy.exists() { "" } else { " (missing - using defaults)" }
    );

    Ok(())
}

fn report_outcome(report: &RunReport, done: &str) -> Result<()> {
    print_summary(&report.summary);
    let run = &report.run;

    match &run.state {
        RunState::Completed => {
            eprintln!("\n[Run {} {}]", run.id, done);
        }
        RunState::Paused { checkpoint, reason } => {
            eprintln!(
                "\n[Run {} paused at checkpoint {}: {}]\n[Resume with: quorum resume {} --approve | --reject]",
                run.id, checkpoint, reason, run.id
            );
        }
        RunState::Halted { reason } => {
            eprintln!("\n[Run {} halted: {}]", run.id, reason);
            std::process::exit(1);
        }
        RunState::Failed { error } => {
            eprintln!("\n[Run {} failed: {}]", run.id, error);
            std::process::exit(1);
        }
        RunState::Running => {
            eprintln!("\n[Run {} in state: {:?}]", run.id, run.state);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{:<4} {:<24} {:<10} {:<10} {:<12} {:<6}",
        "CP", "STAGE", "CACHE", "OUTCOME", "DECISION", "CONF"
    );
    println!("{}", "-".repeat(72));
    for stage in &summary.stages {
        println!(
            "{:<4} {:<24} {:<10} {:<10} {:<12} {:<6.2}",
            stage.checkpoint,
            stage.stage_id,
            format!("{:?}", stage.cache).to_lowercase(),
            stage.outcome,
            stage.decision.as_str(),
            stage.confidence
        );
    }

    println!();
    for checkpoint in &summary.checkpoints {
        println!(
            "Checkpoint {} '{}': {} ({:.3}){}",
            checkpoint.index,
            checkpoint.name,
            checkpoint.consensus,
            checkpoint.aggregate_confidence,
            if checkpoint.needs_escalation {
                format!(
                    " escalated [{}] -> {}",
                    checkpoint.escalation_reasons.join("; "),
                    checkpoint.action.as_deref().unwrap_or("halt")
                )
            } else {
                String::new()
            }
        );
    }
    println!(
        "\nCache hits: {}/{}  Escalations: {}",
        summary.cache_hits(),
        summary.stages.len(),
        summary.escalations()
    );
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Paused { .. } => "paused",
        RunState::Completed => "completed",
        RunState::Halted { .. } => "halted",
        RunState::Failed { .. } => "failed",
    }
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

fn coordinator_for(pipeline: &Pipeline) -> Result<Coordinator> {
    Ok(Coordinator::new(
        StageRegistry::from_pipeline(pipeline),
        CacheStore::open_default()?,
        config::runs_dir()?,
    ))
}

/// Load a pipeline by name or path
fn load_pipeline(name: &str) -> Result<Pipeline> {
    let cfg = config::config()?;
    let configured = cfg.pipeline_path(name);
    if configured.exists() {
        return load_and_validate(&configured);
    }

    // Try the working directory
    let local = PathBuf::from("pipelines").join(format!("{}.yaml", name));
    if local.exists() {
        return load_and_validate(&local);
    }

    anyhow::bail!(
        "Pipeline '{}' not found. Looked for:\n  - {}\n  - {}",
        name,
        configured.display(),
        local.display()
    )
}

fn load_and_validate(path: &Path) -> Result<Pipeline> {
    let pipeline = Pipeline::from_file(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}

/// Load the policy set, falling back to defaults when no file exists
fn load_policies(explicit: Option<PathBuf>) -> Result<PolicySet> {
    if let Some(path) = explicit {
        return Ok(PolicySet::from_file(&path)?);
    }

    let default_path = config::policy_path()?;
    if default_path.exists() {
        Ok(PolicySet::from_file(&default_path)?)
    } else {
        Ok(PolicySet::single(Default::default())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resume_requires_a_resolution() {
        let parsed = Cli::try_parse_from(["quorum", "resume", "00000000-0000-0000-0000-000000000000"]);
        assert!(parsed.is_err());

        let parsed =
            Cli::try_parse_from(["quorum", "resume", "00000000-0000-0000-0000-000000000000", "--approve", "--reject"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["quorum", "resume", "00000000-0000-0000-0000-000000000000", "--reject"]);
        assert!(matches!(
            parsed.unwrap().command,
            Commands::Resume { approve: false, reject: true, .. }
        ));
    }

    #[test]
    fn test_cache_clear_parses_stage() {
        let parsed = Cli::try_parse_from(["quorum", "cache", "clear", "--stage", "research"]).unwrap();
        match parsed.command {
            Commands::Cache {
                command: CacheCommands::Clear { stage },
            } => assert_eq!(stage.as_deref(), Some("research")),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
