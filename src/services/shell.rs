//! Runs tasks through a configured shell command.
//!
//! The command receives its context through `WAVEFORGE_*` environment
//! variables and may report artifacts by writing JSON to the path in
//! `WAVEFORGE_ARTIFACTS_FILE`:
//!
//! ```json
//! {"files_created": ["src/auth.rs"], "exports_added": ["login"]}
//! ```
//!
//! Exit status 0 passes the task; anything else blocks it with the tail of
//! stderr as the reason.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::services::{ExecutionContext, TaskExecutor, TaskOutcome};
use crate::task::{Task, TaskArtifacts};

const STDERR_TAIL_LINES: usize = 5;

pub struct ShellTaskExecutor {
    command: String,
    artifacts_dir: PathBuf,
}

impl ShellTaskExecutor {
    pub fn new(command: &str, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.to_string(),
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Readable file name per task; the id hash keeps `a.b` and `a_b` apart.
    fn artifacts_path(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let digest = format!("{:x}", Sha256::digest(task_id.as_bytes()));
        self.artifacts_dir
            .join(format!("{}-{}.json", safe, &digest[..8]))
    }

    fn base_command(&self, ctx: &ExecutionContext, mode: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&ctx.project_dir)
            .env("WAVEFORGE_MODE", mode)
            .env("WAVEFORGE_PIPELINE", &ctx.pipeline_id)
            .env("WAVEFORGE_WAVE", ctx.wave.to_string())
            .env("WAVEFORGE_WAVE_BRANCH", &ctx.wave_branch)
            .env("WAVEFORGE_INTEGRATION_BRANCH", &ctx.integration_branch)
            .env("WAVEFORGE_REVIEW_CYCLE", ctx.review_cycle.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn read_artifacts(path: &Path) -> Result<TaskArtifacts, ServiceError> {
        if !path.exists() {
            return Ok(TaskArtifacts::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Other(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| {
            ServiceError::Other(format!("Invalid artifacts file {}: {}", path.display(), e))
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl TaskExecutor for ShellTaskExecutor {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutcome, ServiceError> {
        let artifacts_path = self.artifacts_path(&task.id);
        std::fs::create_dir_all(&self.artifacts_dir).map_err(|e| {
            ServiceError::Other(format!(
                "Failed to create {}: {}",
                self.artifacts_dir.display(),
                e
            ))
        })?;
        let _ = std::fs::remove_file(&artifacts_path);

        debug!(task = %task.id, command = %self.command, "Running task command");
        let output = self
            .base_command(ctx, "task")
            .env("WAVEFORGE_TASK_ID", &task.id)
            .env("WAVEFORGE_TASK_DESCRIPTION", &task.description)
            .env("WAVEFORGE_ARTIFACTS_FILE", &artifacts_path)
            .output()
            .await
            .map_err(|source| ServiceError::Spawn {
                program: "sh".into(),
                source,
            })?;

        if output.status.success() {
            let artifacts = Self::read_artifacts(&artifacts_path)?;
            return Ok(TaskOutcome::Pass(artifacts));
        }

        let tail = stderr_tail(&output.stderr);
        let reason = match output.status.code() {
            Some(code) if tail.is_empty() => format!("task command exited with code {}", code),
            Some(code) => format!("task command exited with code {}: {}", code, tail),
            None => "task command was terminated by a signal".to_string(),
        };
        warn!(task = %task.id, reason = %reason, "Task command failed");
        Ok(TaskOutcome::Blocked(reason))
    }

    async fn address_feedback(&self, ctx: &ExecutionContext) -> Result<bool, ServiceError> {
        let output = self
            .base_command(ctx, "feedback")
            .output()
            .await
            .map_err(|source| ServiceError::Spawn {
                program: "sh".into(),
                source,
            })?;

        if !output.status.success() {
            warn!(
                wave = ctx.wave,
                stderr = %stderr_tail(&output.stderr),
                "Feedback command failed; waiting for operator"
            );
        }
        Ok(output.status.success())
    }
}
