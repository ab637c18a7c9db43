//! Append-only audit log with file-based persistence.
//!
//! Entries are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Each run directory is guarded by an
//! exclusive lock so a single coordinator drives a run.

use std::fs::OpenOptions as StdOpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{AuditEntry, RunSummary};

const AUDIT_FILE: &str = "audit.jsonl";
const SUMMARY_FILE: &str = "summary.json";
const LOCK_FILE: &str = "run.lock";

/// Exclusive lock on a run directory, released on drop
#[derive(Debug)]
pub struct RunLock {
    file: std::fs::File,
}

impl RunLock {
    /// Acquire the lock without blocking
    pub fn acquire(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(LOCK_FILE);
        let file = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open run lock: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "Run directory {} is locked by another coordinator",
                run_dir.display()
            )
        })?;

        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// File-based audit log using JSONL format
#[derive(Debug)]
pub struct AuditLog {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the audit.jsonl file
    audit_path: PathBuf,

    _lock: RunLock,
}

impl AuditLog {
    /// Create or open the audit log for a run, taking the run lock
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let lock = RunLock::acquire(&run_dir)?;
        let audit_path = run_dir.join(AUDIT_FILE);

        Ok(Self {
            run_dir,
            audit_path,
            _lock: lock,
        })
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Get the path to the audit file
    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    /// Append an entry to the log
    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.audit_path.display()))?;

        // One write per entry so a line is either fully present or absent
        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write audit entry")?;
        file.flush().await.context("Failed to flush audit entry")?;

        Ok(())
    }

    /// Replay all entries in order
    pub async fn replay(&self) -> Result<Vec<AuditEntry>> {
        read_entries(&self.audit_path).await
    }

    /// Write the run summary next to the log
    pub async fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.run_dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;

        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write run summary: {}", path.display()))?;

        Ok(path)
    }

    /// Read a run's entries without taking the lock
    pub async fn replay_run(runs_dir: &Path, run_id: Uuid) -> Result<Vec<AuditEntry>> {
        read_entries(&runs_dir.join(run_id.to_string()).join(AUDIT_FILE)).await
    }

    /// Read a run's summary, if one was written
    pub async fn read_summary(runs_dir: &Path, run_id: Uuid) -> Result<Option<RunSummary>> {
        let path = runs_dir.join(run_id.to_string()).join(SUMMARY_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run summary: {}", path.display()))?;
        let summary = serde_json::from_str(&content).context("Failed to parse run summary")?;
        Ok(Some(summary))
    }

    /// List all run IDs in the runs directory
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !fs::try_exists(runs_dir).await? {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

async fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open audit log: {}", path.display()))?;

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut entries = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse audit entry: {}", line))?;
        entries.push(entry);
    }

    Ok(entries)
}
