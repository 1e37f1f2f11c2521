//! Job Engine: the iteration loop for one working directory.
//!
//! Each job runs as its own tokio task and owns its [`Job`] record; other tasks
//! only read snapshots or raise the cancel flag through [`JobTable`].
//! Cancellation is cooperative and observed once per loop pass, so its latency
//! is bounded by one iteration (at most the hard agent timeout plus validation).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::core::retry::RetryTracker;
use crate::core::selector::{Selection, remaining, select};
use crate::core::types::{IterationResult, JobStatus};
use crate::io::config::{RunnerConfig, load_config};
use crate::io::context::PreviousAttempt;
use crate::io::init::RunnerPaths;
use crate::io::iteration_log::{IterationLog, LogContents, ProgressNotes};
use crate::io::prd::{load_prd, mark_story_complete};
use crate::iteration::{Collaborators, IterationRequest, IterationRunner};

static JOB_SEQ: AtomicU64 = AtomicU64::new(1);

/// Externally visible state of one job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub workdir: PathBuf,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Iterations run so far (skips excluded).
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_story: Option<String>,
    pub completed_stories: u32,
    /// In iteration order.
    pub results: Vec<IterationResult>,
    /// Stories skipped for exceeding the retry limit.
    pub skipped: Vec<String>,
    pub error: Option<String>,
    /// Set when the job completed with work remaining.
    pub warning: Option<String>,
}

impl Job {
    pub fn iterations_run(&self) -> usize {
        self.results.len()
    }
}

/// Overrides applied on top of `.runner/config.toml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    pub max_iterations: Option<u32>,
    pub stop_on_failure: Option<bool>,
}

#[derive(Debug)]
struct JobCell {
    job: Mutex<Job>,
    cancel: AtomicBool,
}

impl JobCell {
    fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Job {
        self.lock().clone()
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Move from `Running` to a terminal status. Later calls are ignored.
    fn finish(&self, status: JobStatus, error: Option<String>, warning: Option<String>) {
        let mut job = self.lock();
        if job.status.is_terminal() {
            warn!(job_id = %job.id, current = job.status.as_str(), requested = status.as_str(), "ignoring second terminal transition");
            return;
        }
        job.status = status;
        job.finished_at = Some(Utc::now());
        job.current_story = None;
        job.error = error;
        job.warning = warning;
    }
}

/// Shared job table keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<String, Arc<JobCell>>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<JobCell>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, cell: Arc<JobCell>) -> Result<()> {
        let mut jobs = self.lock();
        let (id, workdir) = {
            let job = cell.lock();
            (job.id.clone(), job.workdir.clone())
        };
        let busy = jobs.values().any(|other| {
            let other = other.lock();
            other.status == JobStatus::Running && other.workdir == workdir
        });
        if busy {
            return Err(anyhow!(
                "a job is already running in {}",
                workdir.display()
            ));
        }
        jobs.insert(id, cell);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).map(|cell| cell.snapshot())
    }

    /// Snapshots of every job, ordered by start time.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().map(|cell| cell.snapshot()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Request cancellation; takes effect at the job's next loop pass.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(cell) if !cell.lock().status.is_terminal() => {
                cell.cancel.store(true, Ordering::SeqCst);
                info!(job_id = id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Request cancellation of every running job; returns how many were flagged.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Drop a finished job from the table.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let mut jobs = self.lock();
        if jobs.get(id).is_some_and(|cell| !cell.lock().status.is_terminal()) {
            return None;
        }
        jobs.remove(id).map(|cell| cell.snapshot())
    }
}

/// A started job.
#[derive(Debug)]
pub struct JobHandle {
    pub id: String,
    join: JoinHandle<Job>,
}

impl JobHandle {
    /// Wait for the job to reach a terminal status.
    pub async fn wait(self) -> Result<Job> {
        self.join.await.context("job task panicked")
    }
}

/// Starts jobs and registers them in a [`JobTable`].
#[derive(Clone)]
pub struct JobEngine {
    table: JobTable,
    collaborators: Collaborators,
}

impl JobEngine {
    pub fn new(table: JobTable, collaborators: Collaborators) -> Self {
        Self {
            table,
            collaborators,
        }
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    /// Load config and spawn the job loop.
    ///
    /// Configuration errors are returned here; story-file errors end the job
    /// as `failed`. `workdir` is canonicalized, so differently spelled paths to
    /// one tree count as the same working directory.
    pub fn start(&self, workdir: &Path, options: JobOptions) -> Result<JobHandle> {
        let workdir = workdir
            .canonicalize()
            .with_context(|| format!("resolve working directory {}", workdir.display()))?;
        let workdir = workdir.as_path();
        let paths = RunnerPaths::new(workdir);
        if !paths.runner_dir.is_dir() {
            return Err(anyhow!(
                "no .runner directory in {} (run `story-runner init`)",
                workdir.display()
            ));
        }
        let mut config = load_config(&paths.config_path)?;
        if let Some(max) = options.max_iterations {
            config.max_iterations = max;
        }
        if let Some(stop) = options.stop_on_failure {
            config.stop_on_failure = stop;
        }

        let id = format!(
            "job-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            JOB_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        let cell = Arc::new(JobCell {
            job: Mutex::new(Job {
                id: id.clone(),
                workdir: workdir.to_path_buf(),
                status: JobStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                iteration: 0,
                max_iterations: config.max_iterations,
                current_story: None,
                completed_stories: 0,
                results: Vec::new(),
                skipped: Vec::new(),
                error: None,
                warning: None,
            }),
            cancel: AtomicBool::new(false),
        });
        self.table.insert(cell.clone())?;

        let runner = IterationRunner::new(config.clone(), paths.clone(), self.collaborators.clone());
        let task_id = id.clone();
        let loop_cell = cell.clone();
        let job_loop = tokio::spawn(async move {
            run_job(&task_id, &loop_cell, &config, &paths, &runner).await;
        });
        let join = tokio::spawn(async move {
            if let Err(err) = job_loop.await {
                error!(job_id = %cell.snapshot().id, %err, "job loop aborted");
                cell.finish(
                    JobStatus::Failed,
                    Some(format!("job loop aborted: {err}")),
                    None,
                );
            }
            cell.snapshot()
        });
        info!(job_id = %id, workdir = %workdir.display(), "job started");
        Ok(JobHandle { id, join })
    }

    /// Start a job and wait for it to finish.
    pub async fn run(&self, workdir: &Path, options: JobOptions) -> Result<Job> {
        self.start(workdir, options)?.wait().await
    }
}

/// What carried over from earlier attempts at each story.
#[derive(Debug, Default)]
struct Carryover {
    previous: HashMap<String, PreviousAttempt>,
    feedback: HashMap<String, String>,
}

impl Carryover {
    /// Last failed attempt per story from the durable log.
    fn from_log(log: &LogContents) -> Self {
        let mut carry = Self::default();
        for entry in &log.entries {
            let result = &entry.result;
            if result.success {
                carry.previous.remove(&result.story_id);
                continue;
            }
            carry.previous.insert(
                result.story_id.clone(),
                PreviousAttempt {
                    outcome: result.outcome,
                    failure_category: result.failure_category,
                    reject_reason: entry.reject_reason.clone(),
                    output: result.output.clone(),
                },
            );
        }
        carry
    }
}

#[instrument(skip_all, fields(job_id = %job_id))]
async fn run_job(
    job_id: &str,
    cell: &JobCell,
    config: &RunnerConfig,
    paths: &RunnerPaths,
    runner: &IterationRunner,
) {
    let progress = ProgressNotes::new(&paths.progress_path);
    let log = match IterationLog::new(&paths.log_path).read() {
        Ok(log) => log,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "iteration log unreadable, starting with empty retry state");
            LogContents::default()
        }
    };
    let mut tracker = RetryTracker::from_results(config.max_retries, log.results());
    let mut carry = Carryover::from_log(&log);
    let mut excluded: HashSet<String> = HashSet::new();
    let mut iterations_run: u32 = 0;
    progress.note(&format!(
        "{job_id} started (max {} iterations)",
        config.max_iterations
    ));

    loop {
        if cell.cancel_requested() {
            info!("job cancelled");
            progress.note(&format!("{job_id} cancelled after {iterations_run} iterations"));
            cell.finish(JobStatus::Cancelled, Some("cancelled".to_string()), None);
            return;
        }

        let prd = match load_prd(&paths.prd_path) {
            Ok(prd) => prd,
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "cannot load stories");
                progress.note(&format!("{job_id} failed: {message}"));
                cell.finish(JobStatus::Failed, Some(message), None);
                return;
            }
        };

        let story = match select(&prd.stories, &excluded, &tracker) {
            Selection::AllDone => {
                let left = prd.stories.iter().filter(|s| !s.complete).count();
                let warning = (left > 0).then(|| {
                    format!("{left} stories skipped after reaching the retry limit")
                });
                info!(iterations_run, "no eligible story left, job complete");
                progress.note(&format!("{job_id} completed after {iterations_run} iterations"));
                cell.finish(JobStatus::Completed, None, warning);
                return;
            }
            Selection::Skip { story, failures } => {
                warn!(story_id = %story.id, failures, "skipping story after repeated failures");
                progress.note(&format!(
                    "{job_id} skipped story {} after {failures} failures (max {})",
                    story.id, config.max_retries
                ));
                excluded.insert(story.id.clone());
                cell.lock().skipped.push(story.id.clone());
                continue;
            }
            Selection::Run(story) => story.clone(),
        };

        if iterations_run >= config.max_iterations {
            let left = remaining(&prd.stories);
            let warning = format!(
                "iteration limit {} reached with {left} stories remaining",
                config.max_iterations
            );
            warn!(left, "iteration limit reached");
            progress.note(&format!("{job_id} completed: {warning}"));
            cell.finish(JobStatus::Completed, None, Some(warning));
            return;
        }

        iterations_run += 1;
        {
            let mut job = cell.lock();
            job.iteration = iterations_run;
            job.current_story = Some(story.id.clone());
        }
        let attempt = tracker.state(&story.id).attempts + 1;
        let record = runner
            .run_story(&IterationRequest {
                job_id,
                iteration: iterations_run,
                project: &prd.project,
                story: &story,
                attempt,
                previous: carry.previous.get(&story.id),
                activity_feedback: carry.feedback.get(&story.id).map(String::as_str),
            })
            .await;

        if let Some(log_error) = &record.log_error {
            let message = format!(
                "iteration log write failed for story {} (iteration {iterations_run}): {log_error}",
                story.id
            );
            error!(err = %message, "iteration log unwritable");
            progress.note(&format!("{job_id} failed: {message}"));
            cell.lock().results.push(record.result);
            cell.finish(JobStatus::Failed, Some(message), None);
            return;
        }

        let success = record.result.success;
        tracker.record_attempt(&story.id, success);
        if success {
            carry.previous.remove(&story.id);
            carry.feedback.remove(&story.id);
            if let Err(err) = mark_story_complete(&paths.prd_path, &story.id) {
                let message = format!("failed to mark story {} complete: {err:#}", story.id);
                error!(err = %message, "story state not persisted");
                cell.lock().results.push(record.result);
                cell.finish(JobStatus::Failed, Some(message), None);
                return;
            }
        } else {
            carry
                .previous
                .insert(story.id.clone(), record.previous_attempt());
            match record.activity.and_then(|stats| stats.feedback()) {
                Some(feedback) => {
                    carry.feedback.insert(story.id.clone(), feedback);
                }
                None => {
                    carry.feedback.remove(&story.id);
                }
            }
        }
        {
            let mut job = cell.lock();
            if success {
                job.completed_stories += 1;
            }
            job.current_story = None;
            job.results.push(record.result.clone());
        }

        if !success && config.stop_on_failure {
            let message = format!(
                "iteration {iterations_run} failed for story {}: {}",
                story.id,
                record.result.outcome.as_str()
            );
            warn!(%message, "stopping on first failure");
            progress.note(&format!("{job_id} failed: {message}"));
            cell.finish(JobStatus::Failed, Some(message), None);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::types::IterationOutcome;
    use crate::io::iteration_log::LogEntry;
    use crate::test_support::{ScriptedExecutor, ScriptedStep, ScriptedValidator, collaborators, result};

    fn engine(steps: Vec<ScriptedStep>) -> JobEngine {
        JobEngine::new(
            JobTable::new(),
            collaborators(
                Arc::new(ScriptedExecutor::new(steps)),
                Arc::new(ScriptedValidator::passing()),
            ),
        )
    }

    fn running_job(id: &str, workdir: &str) -> Arc<JobCell> {
        Arc::new(JobCell {
            job: Mutex::new(Job {
                id: id.to_string(),
                workdir: PathBuf::from(workdir),
                status: JobStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                iteration: 0,
                max_iterations: 3,
                current_story: None,
                completed_stories: 0,
                results: Vec::new(),
                skipped: Vec::new(),
                error: None,
                warning: None,
            }),
            cancel: AtomicBool::new(false),
        })
    }

    #[test]
    fn terminal_transitions_are_monotonic() {
        let cell = running_job("j", "/w");
        cell.finish(JobStatus::Failed, Some("boom".to_string()), None);
        cell.finish(JobStatus::Completed, None, None);
        let job = cell.snapshot();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn table_refuses_second_running_job_in_same_workdir() {
        let table = JobTable::new();
        table.insert(running_job("a", "/w")).expect("insert");
        assert!(table.insert(running_job("b", "/w")).is_err());
        table.insert(running_job("c", "/other")).expect("insert");
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn cancel_flags_only_running_jobs() {
        let table = JobTable::new();
        let cell = running_job("a", "/w");
        table.insert(cell.clone()).expect("insert");
        assert!(table.cancel("a"));
        assert!(cell.cancel_requested());
        assert!(!table.cancel("missing"));

        cell.finish(JobStatus::Cancelled, None, None);
        assert!(!table.cancel("a"));
        assert_eq!(table.cancel_all(), 0);
        assert!(table.remove("a").is_some());
    }

    #[test]
    fn carryover_keeps_last_failure_per_story() {
        let now = Utc::now();
        let entry = |story: &str, success: bool, output: &str| LogEntry {
            job_id: "old".to_string(),
            iteration: 1,
            started_at: now,
            finished_at: now,
            result: IterationResult {
                output: output.to_string(),
                ..result(story, success)
            },
            reject_reason: None,
            prompt_hash: None,
            prompt_path: None,
        };
        let log = LogContents {
            entries: vec![
                entry("a", false, "first"),
                entry("a", false, "second"),
                entry("b", false, "b failed"),
                entry("b", true, ""),
            ],
            malformed: 0,
        };
        let carry = Carryover::from_log(&log);
        assert_eq!(carry.previous["a"].output, "second");
        assert_eq!(carry.previous["a"].outcome, IterationOutcome::ValidationFailed);
        assert!(!carry.previous.contains_key("b"));
    }

    #[tokio::test]
    async fn start_without_runner_dir_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = engine(Vec::new())
            .start(temp.path(), JobOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("no .runner directory"));
    }
}
