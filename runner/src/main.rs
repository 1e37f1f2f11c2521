//! Unattended coding-agent runner.
//!
//! Works through the stories in `.runner/prd.json`, one agent session per
//! iteration, committing only validated and verified changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use story_runner::core::retry::{RetryDecision, RetryTracker};
use story_runner::core::selector::{Selection, select};
use story_runner::core::types::{IterationResult, JobStatus};
use story_runner::exit_codes;
use story_runner::io::collaborators::{NoopIssueTracker, NoopMemory};
use story_runner::io::config::load_config;
use story_runner::io::context::TemplateContextBuilder;
use story_runner::io::executor::CommandExecutor;
use story_runner::io::init::{InitOptions, RunnerPaths, init_runner};
use story_runner::io::iteration_log::{IterationLog, LogEntry};
use story_runner::io::prd::load_prd;
use story_runner::io::supervisor::{ProcessRegistry, install_shutdown_handler};
use story_runner::io::validation::ShellValidator;
use story_runner::iteration::Collaborators;
use story_runner::job::{Job, JobEngine, JobOptions, JobTable};
use story_runner::logging;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "story-runner",
    version,
    about = "Run a coding agent over a story backlog, one verified commit at a time"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runner/` with a default config and an empty story file.
    Init {
        /// Overwrite existing runner files.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Run one job until every story is done, the iteration limit is hit, or it fails.
    Run {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Override `max_iterations` from config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// End the job on the first failed iteration.
        #[arg(long)]
        stop_on_failure: bool,
    },
    /// Print the id of the next eligible story.
    Next {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Show recent iteration log entries.
    Log {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Only entries for this story, plus its retry state.
        #[arg(long)]
        story: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, dir } => cmd_init(&dir, force),
        Command::Run {
            dir,
            max_iterations,
            stop_on_failure,
        } => {
            cmd_run(
                &dir,
                JobOptions {
                    max_iterations,
                    stop_on_failure: stop_on_failure.then_some(true),
                },
            )
            .await
        }
        Command::Next { dir } => cmd_next(&dir),
        Command::Log { dir, story, limit } => cmd_log(&dir, story.as_deref(), limit),
    }
}

fn cmd_init(dir: &Path, force: bool) -> Result<i32> {
    let paths = init_runner(dir, &InitOptions { force })?;
    println!("initialized {}", paths.runner_dir.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(dir: &Path, options: JobOptions) -> Result<i32> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("resolve {}", dir.display()))?;
    let paths = RunnerPaths::new(&dir);
    let config = load_config(&paths.config_path)?;

    let registry = ProcessRegistry::new();
    let collaborators = Collaborators {
        executor: Arc::new(CommandExecutor::new(
            config.agent.clone(),
            registry.clone(),
            config.output_limit_bytes,
        )),
        validator: Arc::new(ShellValidator::new(
            registry.clone(),
            config.output_limit_bytes,
        )),
        context: Arc::new(TemplateContextBuilder::new()),
        memory: Arc::new(NoopMemory),
        issues: Arc::new(NoopIssueTracker),
    };
    let table = JobTable::new();
    let engine = JobEngine::new(table.clone(), collaborators);

    let cancel_table = table.clone();
    let shutdown = install_shutdown_handler(registry, config.shutdown_grace(), move || {
        cancel_table.cancel_all();
    })?;

    let handle = engine.start(&dir, options)?;
    let id = handle.id.clone();
    println!("job {id} started in {}", dir.display());

    let wait = handle.wait();
    tokio::pin!(wait);
    let mut printed = 0;
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    let job = loop {
        tokio::select! {
            job = &mut wait => break job?,
            _ = tick.tick() => {
                if let Some(snapshot) = table.get(&id) {
                    printed = print_new_results(&snapshot.results, printed);
                }
            }
        }
    };
    print_new_results(&job.results, printed);
    shutdown.abort();
    print_summary(&job);

    Ok(match job.status {
        JobStatus::Completed | JobStatus::Running => exit_codes::OK,
        JobStatus::Failed => exit_codes::FAILED,
        JobStatus::Cancelled => exit_codes::CANCELLED,
    })
}

fn print_new_results(results: &[IterationResult], printed: usize) -> usize {
    for (index, result) in results.iter().enumerate().skip(printed) {
        println!("{}", result_line(index + 1, result));
    }
    results.len().max(printed)
}

fn result_line(iteration: usize, result: &IterationResult) -> String {
    let mut line = format!(
        "#{iteration} {} {} ({:.1}s, {} tool calls)",
        result.story_id,
        result.outcome.as_str(),
        result.duration_ms as f64 / 1000.0,
        result.tool_calls
    );
    if let Some(commit) = &result.commit {
        line.push_str(&format!(" commit {}", &commit[..commit.len().min(12)]));
    }
    if let Some(category) = result.failure_category {
        line.push_str(&format!(" [{}]", category.as_str()));
    }
    line
}

fn print_summary(job: &Job) {
    println!(
        "job {} {}: {} iterations, {} stories completed",
        job.id,
        job.status.as_str(),
        job.iterations_run(),
        job.completed_stories
    );
    if !job.skipped.is_empty() {
        println!("skipped: {}", job.skipped.join(", "));
    }
    if let Some(warning) = &job.warning {
        println!("warning: {warning}");
    }
    if let Some(error) = &job.error {
        eprintln!("error: {error}");
    }
}

fn cmd_next(dir: &Path) -> Result<i32> {
    let paths = RunnerPaths::new(dir);
    let config = load_config(&paths.config_path)?;
    let prd = load_prd(&paths.prd_path)?;
    let log = IterationLog::new(&paths.log_path).read()?;
    let tracker = RetryTracker::from_results(config.max_retries, log.results());

    let mut excluded = HashSet::new();
    loop {
        match select(&prd.stories, &excluded, &tracker) {
            Selection::AllDone => {
                eprintln!("no eligible story");
                return Ok(exit_codes::NO_STORY);
            }
            Selection::Skip { story, .. } => {
                excluded.insert(story.id.clone());
            }
            Selection::Run(story) => {
                println!("{}", story.id);
                return Ok(exit_codes::OK);
            }
        }
    }
}

fn cmd_log(dir: &Path, story: Option<&str>, limit: usize) -> Result<i32> {
    let paths = RunnerPaths::new(dir);
    let log = IterationLog::new(&paths.log_path).read()?;
    if log.malformed > 0 {
        eprintln!("skipped {} malformed log lines", log.malformed);
    }
    let entries: Vec<&LogEntry> = log
        .entries
        .iter()
        .filter(|entry| story.is_none_or(|id| entry.result.story_id == id))
        .collect();
    for entry in &entries[entries.len().saturating_sub(limit)..] {
        println!("{}", entry_line(entry));
    }

    if let Some(id) = story {
        let config = load_config(&paths.config_path)?;
        let prd = load_prd(&paths.prd_path)?;
        let complete = prd.story(id).is_some_and(|s| s.complete);
        let tracker = RetryTracker::from_results(config.max_retries, log.results());
        let state = tracker.state(id);
        let decision = match tracker.decide(id, complete) {
            RetryDecision::Retry => "retry",
            RetryDecision::Skip => "skip",
            RetryDecision::Complete => "complete",
        };
        println!(
            "{id}: {} attempts, {} failures (max {}), {decision}",
            state.attempts,
            state.failures,
            tracker.max_retries()
        );
    }
    Ok(exit_codes::OK)
}

fn entry_line(entry: &LogEntry) -> String {
    let mut line = format!(
        "{} {} {}",
        entry.finished_at.format("%Y-%m-%d %H:%M:%S"),
        entry.job_id,
        result_line(entry.iteration as usize, &entry.result)
    );
    if let Some(reason) = &entry.reject_reason {
        line.push_str(&format!(": {reason}"));
    }
    line
}
