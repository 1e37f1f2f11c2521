//! Iteration Runner: one attempt at one story.
//!
//! build prompt -> spawn agent -> validate -> verify -> commit or reject -> record.
//!
//! [`IterationRunner::run_story`] never returns an error. Every exit path,
//! including spawn failures and internal I/O errors, produces exactly one
//! [`IterationResult`] and one durable log entry. When that entry cannot be
//! written the record carries the error in [`IterationRecord::log_error`].
//!
//! Once the agent has run, any outcome other than `committed` puts the working
//! tree (outside `.runner/`) back to the pre-iteration HEAD.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::activity::ActivityStats;
use crate::core::classifier::classify_failure;
use crate::core::types::{
    FailureCategory, IterationOutcome, IterationResult, Story, tail_chars,
};
use crate::core::verifier::{DiffStats, VerificationReport, VerifyInput, verify};
use crate::io::collaborators::{IssueTracker, MemoryStore, best_effort};
use crate::io::config::RunnerConfig;
use crate::io::context::{ContextBuilder, PreviousAttempt, PromptInput};
use crate::io::executor::{AgentRun, ExecRequest, Executor, Termination};
use crate::io::git::Git;
use crate::io::init::RunnerPaths;
use crate::io::iteration_log::{IterationLog, LogEntry, ProgressNotes, PromptStore, StoredPrompt};
use crate::io::validation::{ValidationOutcome, ValidationRequest, Validator};

/// Upper bound on diff text handed to the verifier.
const DIFF_CONTENT_LIMIT: usize = 200_000;

/// Pluggable collaborators shared by every iteration of a job.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn Executor>,
    pub validator: Arc<dyn Validator>,
    pub context: Arc<dyn ContextBuilder>,
    pub memory: Arc<dyn MemoryStore>,
    pub issues: Arc<dyn IssueTracker>,
}

/// Per-iteration inputs from the job engine.
#[derive(Debug, Clone, Copy)]
pub struct IterationRequest<'a> {
    pub job_id: &'a str,
    /// 1-based iteration number within the job.
    pub iteration: u32,
    pub project: &'a str,
    pub story: &'a Story,
    /// 1-based attempt number for this story across runs.
    pub attempt: u32,
    pub previous: Option<&'a PreviousAttempt>,
    pub activity_feedback: Option<&'a str>,
}

/// A recorded iteration plus what the next attempt should know about it.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub result: IterationResult,
    pub reject_reason: Option<String>,
    pub activity: Option<ActivityStats>,
    /// Set when the durable log entry could not be appended.
    pub log_error: Option<String>,
}

impl IterationRecord {
    pub fn previous_attempt(&self) -> PreviousAttempt {
        PreviousAttempt {
            outcome: self.result.outcome,
            failure_category: self.result.failure_category,
            reject_reason: self.reject_reason.clone(),
            output: self.result.output.clone(),
        }
    }
}

pub struct IterationRunner {
    config: RunnerConfig,
    paths: RunnerPaths,
    git: Git,
    collaborators: Collaborators,
    log: IterationLog,
    prompts: PromptStore,
    progress: ProgressNotes,
}

/// Side facts of an attempt needed after its outcome is known.
#[derive(Debug, Default)]
struct AttemptScratch {
    prompt: Option<StoredPrompt>,
    base: Option<String>,
    agent_ran: bool,
}

/// Accumulates the fields of one result while the iteration progresses.
struct Draft {
    story_id: String,
    started: Instant,
    session_id: Option<String>,
    tool_calls: u32,
    files_modified: Vec<String>,
    output: String,
    validation_passed: bool,
    verification: Option<VerificationReport>,
    failure_category: Option<FailureCategory>,
    commit: Option<String>,
    activity: Option<ActivityStats>,
}

impl Draft {
    fn new(story_id: &str) -> Self {
        Self {
            story_id: story_id.to_string(),
            started: Instant::now(),
            session_id: None,
            tool_calls: 0,
            files_modified: Vec::new(),
            output: String::new(),
            validation_passed: false,
            verification: None,
            failure_category: None,
            commit: None,
            activity: None,
        }
    }

    fn absorb_run(&mut self, run: &AgentRun) {
        self.session_id.clone_from(&run.stream.session_id);
        self.tool_calls = run.stream.tool_calls;
        self.files_modified.clone_from(&run.stream.files_modified);
        self.output.clone_from(&run.output);
        self.activity = Some(run.activity);
    }

    fn finish(self, outcome: IterationOutcome, output_chars: usize) -> IterationRecord {
        let success = outcome == IterationOutcome::Committed;
        let reject_reason = self
            .verification
            .as_ref()
            .and_then(VerificationReport::reject_reason);
        let result = IterationResult {
            success,
            story_id: self.story_id,
            outcome,
            validation_passed: self.validation_passed,
            commit: self.commit,
            session_id: self.session_id,
            output: tail_chars(self.output.trim(), output_chars),
            tool_calls: self.tool_calls,
            files_modified: self.files_modified,
            duration_ms: self.started.elapsed().as_millis() as u64,
            verification_passed: self.verification.as_ref().map(|v| v.passed),
            verification_warnings: self
                .verification
                .as_ref()
                .map(VerificationReport::warning_lines)
                .unwrap_or_default(),
            requires_review: self
                .verification
                .as_ref()
                .is_some_and(|v| v.requires_review),
            failure_category: if success { None } else { self.failure_category },
        };
        IterationRecord {
            result,
            reject_reason,
            activity: self.activity,
            log_error: None,
        }
    }
}

impl IterationRunner {
    pub fn new(config: RunnerConfig, paths: RunnerPaths, collaborators: Collaborators) -> Self {
        Self {
            git: Git::new(&paths.root),
            log: IterationLog::new(&paths.log_path),
            prompts: PromptStore::new(&paths.prompts_dir, config.prompt_retention),
            progress: ProgressNotes::new(&paths.progress_path),
            config,
            paths,
            collaborators,
        }
    }

    #[instrument(skip_all, fields(job_id = %request.job_id, iteration = request.iteration, story_id = %request.story.id))]
    pub async fn run_story(&self, request: &IterationRequest<'_>) -> IterationRecord {
        let started_at = Utc::now();
        let mut scratch = AttemptScratch::default();
        let mut record = self.attempt(request, &mut scratch).await;
        if scratch.agent_ran && record.result.outcome != IterationOutcome::Committed {
            self.discard_changes(scratch.base).await;
        }
        record.log_error = self
            .record(request, &record, started_at, scratch.prompt.as_ref())
            .await;
        record
    }

    async fn attempt(
        &self,
        request: &IterationRequest<'_>,
        scratch: &mut AttemptScratch,
    ) -> IterationRecord {
        let story = request.story;
        let limit = self.config.captured_output_chars;
        let mut draft = Draft::new(&story.id);

        let memories = best_effort(
            "memory.recall",
            self.config.collaborator_timeout(),
            self.collaborators.memory.recall(story),
        )
        .await
        .unwrap_or_default();

        let validation_command = story
            .validation_command
            .clone()
            .unwrap_or_else(|| self.config.validation.command.clone());
        let prompt = match self.collaborators.context.build(&PromptInput {
            project: request.project,
            story,
            attempt: request.attempt,
            max_retries: self.config.max_retries,
            validation_command: &validation_command,
            previous: request.previous,
            activity_feedback: request.activity_feedback,
            memories: &memories,
        }) {
            Ok(prompt) => prompt,
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to build prompt");
                draft.output = format!("prompt construction failed: {err:#}");
                return draft.finish(IterationOutcome::InternalError, limit);
            }
        };
        match self.prompts.persist(&prompt) {
            Ok(stored) => scratch.prompt = Some(stored),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to persist prompt"),
        }

        let base = self.blocking_git(|git| git.head_sha()).await.ok();
        scratch.base.clone_from(&base);
        let iteration_dir = self.paths.iteration_dir(request.job_id, request.iteration);
        let exec_request = ExecRequest {
            story_id: story.id.clone(),
            workdir: self.paths.root.clone(),
            prompt,
            output_path: iteration_dir.join("last-message.md"),
            log_path: iteration_dir.join("agent.log"),
            timeout: self.config.iteration_timeout(),
            stall_timeout: self.config.stall_timeout(),
        };

        let run = match self.collaborators.executor.exec(&exec_request).await {
            Ok(run) => run,
            Err(err) => {
                error!(err = %format!("{err:#}"), "agent spawn failed");
                draft.output = format!("agent spawn failed: {err:#}");
                return draft.finish(IterationOutcome::SpawnFailed, limit);
            }
        };
        scratch.agent_ran = true;
        draft.absorb_run(&run);

        match run.termination {
            Termination::TimedOut => {
                draft.failure_category = Some(FailureCategory::Timeout);
                draft.output.push_str(&format!(
                    "\nagent timed out after {}s",
                    self.config.iteration_timeout_secs
                ));
                return draft.finish(IterationOutcome::TimedOut, limit);
            }
            Termination::Stalled => {
                draft.failure_category = Some(FailureCategory::Timeout);
                draft.output.push_str(&format!(
                    "\nagent stalled: no progress for {}s",
                    self.config.stall_timeout_secs
                ));
                return draft.finish(IterationOutcome::Stalled, limit);
            }
            Termination::Exited if !run.succeeded() => {
                draft.output.push_str(&format!(
                    "\nagent exited with status {:?}",
                    run.exit_code
                ));
                draft.failure_category = Some(classify_failure(&draft.output));
                return draft.finish(IterationOutcome::AgentFailed, limit);
            }
            Termination::Exited => {}
        }

        let validation = self
            .validate(&story.id, &validation_command, &iteration_dir.join("validation.log"))
            .await;
        draft.validation_passed = validation.passed;
        if !validation.passed {
            draft.output = validation.output;
            draft.failure_category = Some(classify_failure(&draft.output));
            return draft.finish(IterationOutcome::ValidationFailed, limit);
        }

        let base_for_diff = base.clone();
        let diff = self
            .blocking_git(move |git| Ok(git.diff_stats(base_for_diff.as_deref())))
            .await
            .unwrap_or_default();
        let base_for_content = base.clone();
        let diff_content = self
            .blocking_git(move |git| {
                Ok(git.diff_content(base_for_content.as_deref(), DIFF_CONTENT_LIMIT))
            })
            .await
            .unwrap_or_default();

        let report = verify(&VerifyInput {
            story,
            diff: &diff,
            diff_content: &diff_content,
            tool_calls: run.stream.tool_calls,
            files_modified: &run.stream.files_modified,
            summary: run.summary.as_deref(),
            report: run.report.as_ref(),
            validation_passed: true,
            activity: Some(&run.activity),
        });
        merge_files(&mut draft.files_modified, &diff);
        draft.output = run.summary.clone().unwrap_or_default();
        if report.requires_review {
            warn!(warnings = report.warning_lines().len(), "verification recommends review");
        }
        let passed = report.passed;
        if !passed {
            warn!(reason = ?report.reject_reason(), "verification rejected iteration");
        }
        draft.verification = Some(report);
        if !passed {
            return draft.finish(IterationOutcome::VerificationRejected, limit);
        }

        let message = format!("{}: {}", story.id, story.title);
        match self
            .blocking_git(move |git| git.commit_all(&message))
            .await
        {
            Ok(commit) => {
                draft.commit = commit;
                draft.finish(IterationOutcome::Committed, limit)
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "commit failed");
                draft.output = format!("commit failed: {err:#}");
                draft.finish(IterationOutcome::InternalError, limit)
            }
        }
    }

    async fn validate(
        &self,
        story_id: &str,
        command: &str,
        log_path: &std::path::Path,
    ) -> ValidationOutcome {
        let request = ValidationRequest {
            story_id: story_id.to_string(),
            command: command.to_string(),
            workdir: self.paths.root.clone(),
            timeout: self.config.validation_timeout(),
            log_path: log_path.to_path_buf(),
        };
        match self.collaborators.validator.validate(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(err = %format!("{err:#}"), "validation could not run");
                ValidationOutcome {
                    output: format!("validation could not run: {err:#}"),
                    ..ValidationOutcome::default()
                }
            }
        }
    }

    async fn discard_changes(&self, base: Option<String>) {
        let Some(base) = base else {
            warn!("no base commit, leaving agent changes in place");
            return;
        };
        match self
            .blocking_git(move |git| git.discard_changes(&base))
            .await
        {
            Ok(()) => info!("discarded changes from unaccepted iteration"),
            Err(err) => error!(err = %format!("{err:#}"), "failed to discard agent changes"),
        }
    }

    async fn blocking_git<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Git) -> Result<T> + Send + 'static,
    {
        let git = self.git.clone();
        tokio::task::spawn_blocking(move || f(&git))
            .await
            .map_err(|err| anyhow!("git task failed: {err}"))?
    }

    async fn record(
        &self,
        request: &IterationRequest<'_>,
        record: &IterationRecord,
        started_at: chrono::DateTime<Utc>,
        prompt: Option<&StoredPrompt>,
    ) -> Option<String> {
        let result = &record.result;
        let entry = LogEntry {
            job_id: request.job_id.to_string(),
            iteration: request.iteration,
            started_at,
            finished_at: Utc::now(),
            result: result.clone(),
            reject_reason: record.reject_reason.clone(),
            prompt_hash: prompt.map(|p| p.hash.clone()),
            prompt_path: prompt.map(|p| p.path.display().to_string()),
        };
        let log_error = self.log.append(&entry).err().map(|err| {
            let message = format!("{err:#}");
            error!(err = %message, "failed to append iteration log");
            message
        });
        self.progress.note(&progress_line(request, record));
        info!(
            outcome = result.outcome.as_str(),
            success = result.success,
            tool_calls = result.tool_calls,
            duration_ms = result.duration_ms,
            "iteration recorded"
        );

        let timeout = self.config.collaborator_timeout();
        best_effort(
            "memory.record",
            timeout,
            self.collaborators.memory.record(request.story, result),
        )
        .await;
        if let Some(issue) = &request.story.issue {
            best_effort(
                "issues.iteration_recorded",
                timeout,
                self.collaborators.issues.iteration_recorded(issue, result),
            )
            .await;
        }
        log_error
    }
}

fn merge_files(files: &mut Vec<String>, diff: &DiffStats) {
    for path in &diff.files {
        if !files.contains(path) {
            files.push(path.clone());
        }
    }
}

/// One-line summary for `progress.md`.
pub fn progress_line(request: &IterationRequest<'_>, record: &IterationRecord) -> String {
    let result = &record.result;
    let mut line = format!(
        "{} #{} story {} attempt {}: {}",
        request.job_id,
        request.iteration,
        result.story_id,
        request.attempt,
        result.outcome.as_str()
    );
    if let Some(commit) = &result.commit {
        line.push_str(&format!(" ({})", &commit[..commit.len().min(12)]));
    }
    if let Some(category) = result.failure_category {
        line.push_str(&format!(" [{}]", category.as_str()));
    }
    if let Some(reason) = &record.reject_reason {
        line.push_str(&format!(": {reason}"));
    }
    if !result.verification_warnings.is_empty() {
        line.push_str(&format!(
            " ({} warnings)",
            result.verification_warnings.len()
        ));
    }
    if result.requires_review {
        line.push_str(" [review]");
    }
    line
}
