//! Runner configuration stored under `.runner/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::DEFAULT_MAX_RETRIES;

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound on iterations per job (skips do not count).
    pub max_iterations: u32,

    /// Failures after which a story is skipped.
    pub max_retries: u32,

    /// End the job as failed on the first failed iteration.
    pub stop_on_failure: bool,

    /// Hard wall-clock bound for one agent run, in seconds.
    pub iteration_timeout_secs: u64,

    /// Seconds without a progress event before the agent is considered stalled.
    pub stall_timeout_secs: u64,

    /// Truncate agent and validation stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Characters of output kept on each iteration result.
    pub captured_output_chars: usize,

    /// Number of persisted prompt files to keep.
    pub prompt_retention: usize,

    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub shutdown_grace_secs: u64,

    /// Bound on each best-effort collaborator call (memory, issue tracker).
    pub collaborator_timeout_secs: u64,

    pub agent: AgentConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments; `{model}`, `{sandbox}` and `{output_file}` are substituted.
    /// The prompt is written to stdin.
    pub args: Vec<String>,
    pub model: String,
    pub sandbox: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: [
                "exec",
                "--json",
                "--skip-git-repo-check",
                "--sandbox",
                "{sandbox}",
                "--model",
                "{model}",
                "--output-last-message",
                "{output_file}",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            model: "gpt-5-codex".to_string(),
            sandbox: "workspace-write".to_string(),
        }
    }
}

impl AgentConfig {
    /// Arguments with placeholders substituted.
    pub fn render_args(&self, output_file: &Path) -> Vec<String> {
        let output_file = output_file.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &self.model)
                    .replace("{sandbox}", &self.sandbox)
                    .replace("{output_file}", &output_file)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Shell command run after each agent pass (typecheck, then tests).
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: "npm run typecheck && npm test".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            stop_on_failure: false,
            iteration_timeout_secs: 600,
            stall_timeout_secs: 120,
            output_limit_bytes: 100_000,
            captured_output_chars: 8_000,
            prompt_retention: 50,
            shutdown_grace_secs: 5,
            collaborator_timeout_secs: 15,
            agent: AgentConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.stall_timeout_secs == 0 {
            return Err(anyhow!("stall_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.captured_output_chars == 0 {
            return Err(anyhow!("captured_output_chars must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        if self.validation.command.trim().is_empty() {
            return Err(anyhow!("validation.command must be non-empty"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
