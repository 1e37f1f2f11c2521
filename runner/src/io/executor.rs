//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the iteration runner from the actual agent
//! backend. [`CommandExecutor`] spawns the configured agent command as a
//! process-group leader, streams its JSON events and diagnostics, and races
//! process exit against the hard timeout and the stall detector. Tests use
//! scripted executors that return predetermined runs without spawning.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::core::activity::{ActivityMonitor, ActivityStats};
use crate::core::events::{Decoded, StreamSummary, command_text, decode_line};
use crate::core::types::AgentReport;
use crate::io::config::AgentConfig;
use crate::io::stall::{ProgressHandle, stall_channel};
use crate::io::supervisor::{ProcessRegistry, kill_process_group};

/// How long readers may keep draining pipes after the agent is gone.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub story_id: String,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text, written to the agent's stdin.
    pub prompt: String,
    /// File the agent writes its final message to.
    pub output_path: PathBuf,
    /// Where the captured stdout/stderr log is written.
    pub log_path: PathBuf,
    /// Hard wall-clock bound.
    pub timeout: Duration,
    /// Window without progress events before the run counts as stalled.
    pub stall_timeout: Duration,
}

/// Why the agent process stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Termination {
    #[default]
    Exited,
    TimedOut,
    Stalled,
}

/// Everything captured from one agent run, including partial runs.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub stream: StreamSummary,
    pub activity: ActivityStats,
    /// Diagnostic text (stream errors, then stderr).
    pub output: String,
    pub report: Option<AgentReport>,
    /// Report summary, else raw final message, else last agent message.
    pub summary: Option<String>,
    pub duration: Duration,
}

impl AgentRun {
    /// Exited on its own with status zero.
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Abstraction over agent execution backends.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the agent to completion, timeout or stall.
    ///
    /// Errors only when the agent could not be started.
    async fn exec(&self, request: &ExecRequest) -> Result<AgentRun>;
}

/// Executor that spawns the configured agent command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: AgentConfig,
    registry: ProcessRegistry,
    output_limit_bytes: usize,
}

impl CommandExecutor {
    pub fn new(config: AgentConfig, registry: ProcessRegistry, output_limit_bytes: usize) -> Self {
        Self {
            config,
            registry,
            output_limit_bytes,
        }
    }
}

#[derive(Debug, Default)]
struct Capture {
    stream: StreamSummary,
    activity: ActivityMonitor,
    stdout: LimitedText,
    stderr: LimitedText,
}

#[derive(Debug, Default)]
struct LimitedText {
    text: String,
    truncated: usize,
}

impl LimitedText {
    fn push_line(&mut self, line: &str, limit: usize) {
        let needed = line.len() + 1;
        if self.text.len() + needed > limit {
            self.truncated += needed;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn notice(&self, label: &str) -> String {
        if self.truncated > 0 {
            format!("[{label} truncated {} bytes]\n", self.truncated)
        } else {
            String::new()
        }
    }
}

type SharedCapture = Arc<Mutex<Capture>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(story_id = %request.story_id, timeout_secs = request.timeout.as_secs()))]
    async fn exec(&self, request: &ExecRequest) -> Result<AgentRun> {
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let args = self.config.render_args(&request.output_path);
        info!(command = %self.config.command, workdir = %request.workdir.display(), "starting agent");

        let start = Instant::now();
        let mut child = Command::new(&self.config.command)
            .args(&args)
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn agent {}", self.config.command))?;

        let pid = child.id().unwrap_or(0);
        let _registration = self
            .registry
            .register(pid, format!("agent:{}", request.story_id));
        debug!(pid, "agent spawned");

        let stdin = child.stdin.take();
        let prompt = request.prompt.clone();
        tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(%err, "agent closed stdin early");
                    return;
                }
                let _ = stdin.shutdown().await;
            }
        });

        let capture = SharedCapture::default();
        let (progress, mut stall) = stall_channel(request.stall_timeout);
        let limit = self.output_limit_bytes;
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_events(
                stdout,
                progress,
                capture.clone(),
                start,
                limit,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_diagnostics(
                stderr,
                capture.clone(),
                start,
                limit,
            )));
        }

        let (termination, status) = tokio::select! {
            status = child.wait() => (Termination::Exited, status.ok()),
            () = sleep(request.timeout) => (Termination::TimedOut, None),
            true = stall.next_stall() => (Termination::Stalled, None),
        };
        let status = match status {
            Some(status) => Some(status),
            None => {
                warn!(pid, ?termination, "stopping agent process group");
                kill_process_group(pid);
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        for mut reader in readers {
            if timeout(READER_DRAIN, &mut reader).await.is_err() {
                debug!("reader did not drain in time, aborting");
                reader.abort();
            }
        }

        let duration = start.elapsed();
        let (report, final_message) = read_final_message(&request.output_path);
        let capture = lock(&capture);
        write_agent_log(&request.log_path, &capture, termination);

        let mut output = String::new();
        for error in &capture.stream.errors {
            output.push_str(error);
            output.push('\n');
        }
        output.push_str(&capture.stderr.text);
        output.push_str(&capture.stderr.notice("stderr"));

        let summary = report
            .as_ref()
            .map(|r| r.summary.clone())
            .filter(|s| !s.trim().is_empty())
            .or(final_message)
            .or_else(|| capture.stream.last_message.clone());

        let run = AgentRun {
            termination,
            exit_code: status.and_then(|s| s.code()),
            stream: capture.stream.clone(),
            activity: capture.activity.snapshot(),
            output,
            report,
            summary,
            duration,
        };
        info!(
            ?termination,
            exit_code = ?run.exit_code,
            tool_calls = run.stream.tool_calls,
            malformed = run.stream.malformed,
            duration_ms = duration.as_millis() as u64,
            activity = %run.activity.summary(),
            "agent finished"
        );
        Ok(run)
    }
}

async fn read_events<R: AsyncRead + Unpin>(
    stdout: R,
    progress: ProgressHandle,
    capture: SharedCapture,
    start: Instant,
    limit: usize,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "agent stdout read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        let decoded = decode_line(line);
        if let Decoded::Event(event) = &decoded
            && event.is_progress()
        {
            progress.mark();
        }
        let mut capture = lock(&capture);
        if let Decoded::Event(event) = &decoded
            && let Some(command) = command_text(event)
        {
            capture.activity.observe(command, start.elapsed());
        }
        capture.stream.observe(&decoded);
        capture.stdout.push_line(line, limit);
    }
}

async fn read_diagnostics<R: AsyncRead + Unpin>(
    stderr: R,
    capture: SharedCapture,
    start: Instant,
    limit: usize,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "agent stderr read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        let mut capture = lock(&capture);
        capture.activity.observe(line, start.elapsed());
        capture.stderr.push_line(line, limit);
    }
}

/// Parse the final message file as an [`AgentReport`] when it is a JSON object,
/// otherwise return its trimmed text.
fn read_final_message(path: &Path) -> (Option<AgentReport>, Option<String>) {
    let Ok(contents) = fs::read_to_string(path) else {
        return (None, None);
    };
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed)
        && let Ok(report) = serde_json::from_value::<AgentReport>(value)
    {
        return (Some(report), None);
    }
    (None, Some(trimmed.to_string()))
}

fn write_agent_log(path: &Path, capture: &Capture, termination: Termination) {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&capture.stdout.text);
    buf.push_str(&capture.stdout.notice("stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&capture.stderr.text);
    buf.push_str(&capture.stderr.notice("stderr"));
    match termination {
        Termination::Exited => {}
        Termination::TimedOut => buf.push_str("\n[agent timed out]\n"),
        Termination::Stalled => buf.push_str("\n[agent stalled]\n"),
    }
    let result = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::write(path, buf));
    if let Err(err) = result {
        warn!(path = %path.display(), %err, "failed to write agent log");
    }
}
