//! Validation command execution.
//!
//! The validation command is an arbitrary shell string run in the working
//! directory with a hard timeout; zero exit status means the iteration passed.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::io::supervisor::ProcessRegistry;

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub story_id: String,
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Where combined output is written.
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Run validation. Errors only when the command could not be run at all.
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome>;
}

/// Runs the command through `sh -c`, registered as `validation:<story>` while it runs.
#[derive(Debug, Clone)]
pub struct ShellValidator {
    registry: ProcessRegistry,
    output_limit_bytes: usize,
}

impl ShellValidator {
    pub fn new(registry: ProcessRegistry, output_limit_bytes: usize) -> Self {
        Self {
            registry,
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl Validator for ShellValidator {
    #[instrument(skip_all, fields(story_id = %request.story_id, command = %request.command, timeout_secs = request.timeout.as_secs()))]
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);
        let timeout = request.timeout;
        let limit = self.output_limit_bytes;
        let registry = self.registry.clone();
        let label = format!("validation:{}", request.story_id);
        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, None, timeout, limit, Some((&registry, label.as_str())))
        })
        .await
        .map_err(|err| anyhow!("validation task failed: {err}"))?
        .context("run validation command")?;

        let mut text = output.combined_text();
        if output.timed_out {
            text.push_str(&format!(
                "\nvalidation timed out after {}s\n",
                timeout.as_secs()
            ));
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create validation log dir {}", parent.display()))?;
        }
        if let Err(err) = fs::write(&request.log_path, &text) {
            warn!(path = %request.log_path.display(), %err, "failed to write validation log");
        }

        let outcome = ValidationOutcome {
            passed: output.success(),
            timed_out: output.timed_out,
            exit_code: output.status.code(),
            output: text,
        };
        info!(
            passed = outcome.passed,
            timed_out = outcome.timed_out,
            exit_code = ?outcome.exit_code,
            "validation finished"
        );
        Ok(outcome)
    }
}
