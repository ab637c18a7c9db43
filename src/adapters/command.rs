//! Subprocess stage collaborator.
//!
//! Spawns the configured command, writes the `StageContext` as JSON to
//! stdin and reads a `StageResult` JSON object from stdout. The child is
//! killed if the invocation is dropped (timeout or cancellation).

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Stage, StageContext};
use crate::domain::StageResult;

/// Stage backed by an external command
pub struct CommandStage {
    name: String,
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult> {
        let (program, args) = self
            .argv
            .split_first()
            .with_context(|| format!("Stage '{}' has an empty command", self.name))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("QUORUM_STAGE", &self.name)
            .env("QUORUM_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn command for stage '{}'", self.name))?;

        let request = serde_json::to_vec(ctx).context("Failed to serialize stage context")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .context("Failed to write to stage stdin")?;
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for stage '{}'", self.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Stage '{}' exited with code {}: {}",
                self.name,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Stage output is not valid UTF-8")?;

        serde_json::from_str(stdout.trim())
            .with_context(|| format!("Stage '{}' did not print a result object", self.name))
    }
}
