//! Test-only helpers: story builders, scripted collaborators and a temporary git repo.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::events::StreamSummary;
use crate::core::types::{AgentReport, IterationOutcome, IterationResult, Story};
use crate::io::collaborators::{NoopIssueTracker, NoopMemory};
use crate::io::context::TemplateContextBuilder;
use crate::io::executor::{AgentRun, ExecRequest, Executor, Termination};
use crate::io::git::Git;
use crate::io::init::{InitOptions, RunnerPaths, init_runner};
use crate::io::prd::{Prd, write_prd};
use crate::io::validation::{ValidationOutcome, ValidationRequest, Validator};
use crate::iteration::Collaborators;

/// Incomplete story with deterministic code-flavored text.
pub fn story(id: &str, priority: i64) -> Story {
    Story {
        id: id.to_string(),
        title: format!("Implement {id}"),
        description: format!("Build the {id} feature end to end."),
        priority,
        complete: false,
        validation_command: None,
        acceptance_criteria: Vec::new(),
        issue: None,
    }
}

pub fn completed_story(id: &str, priority: i64) -> Story {
    Story {
        complete: true,
        ..story(id, priority)
    }
}

/// Minimal iteration result for `story_id`.
pub fn result(story_id: &str, success: bool) -> IterationResult {
    IterationResult {
        success,
        story_id: story_id.to_string(),
        outcome: if success {
            IterationOutcome::Committed
        } else {
            IterationOutcome::ValidationFailed
        },
        validation_passed: success,
        commit: None,
        session_id: None,
        output: String::new(),
        tool_calls: 1,
        files_modified: Vec::new(),
        duration_ms: 10,
        verification_passed: None,
        verification_warnings: Vec::new(),
        requires_review: false,
        failure_category: None,
    }
}

/// One scripted agent behavior.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Write files under the workdir and exit cleanly.
    Write {
        files: Vec<(String, String)>,
        summary: String,
        tool_calls: u32,
    },
    /// Exit cleanly without doing anything.
    Idle,
    /// Exit with a non-zero status.
    Crash,
    /// Hit the hard timeout.
    TimedOut,
    /// Fail to start.
    SpawnError,
}

impl ScriptedStep {
    /// A change the verifier accepts: code plus a test, real summary.
    pub fn substantive(name: &str) -> Self {
        Self::Write {
            files: vec![
                (
                    format!("src/{name}.ts"),
                    format!(
                        "export function {name}(input: string): string {{\n  const trimmed = input.trim();\n  if (!trimmed) {{\n    return \"\";\n  }}\n  return trimmed.toUpperCase();\n}}\n"
                    ),
                ),
                (
                    format!("src/{name}.test.ts"),
                    format!(
                        "import {{ {name} }} from \"./{name}\";\n\ntest(\"{name} upper-cases\", () => {{\n  expect({name}(\" a \")).toBe(\"A\");\n}});\n"
                    ),
                ),
            ],
            summary: format!("Implemented {name} with a unit test covering trimming"),
            tool_calls: 4,
        }
    }
}

/// Executor that plays back [`ScriptedStep`]s; `Idle` once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<ScriptedStep>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn exec(&self, request: &ExecRequest) -> Result<AgentRun> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or(ScriptedStep::Idle);
        let mut run = AgentRun {
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            ..AgentRun::default()
        };
        match step {
            ScriptedStep::Write {
                files,
                summary,
                tool_calls,
            } => {
                let mut stream = StreamSummary {
                    session_id: Some(format!("session-{}", request.story_id)),
                    tool_calls,
                    ..StreamSummary::default()
                };
                for (rel, contents) in files {
                    let path = request.workdir.join(&rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, contents)?;
                    stream.files_modified.push(rel);
                }
                run.stream = stream;
                run.report = Some(AgentReport {
                    success: Some(true),
                    summary: summary.clone(),
                });
                run.summary = Some(summary);
            }
            ScriptedStep::Idle => {}
            ScriptedStep::Crash => {
                run.exit_code = Some(1);
                run.output = "agent crashed".to_string();
            }
            ScriptedStep::TimedOut => {
                run.termination = Termination::TimedOut;
                run.exit_code = None;
            }
            ScriptedStep::SpawnError => {
                return Err(anyhow!("spawn agent scripted: No such file or directory"));
            }
        }
        Ok(run)
    }
}

/// Validator with a fixed verdict that counts its calls.
#[derive(Debug, Clone)]
pub struct ScriptedValidator {
    passes: bool,
    output: String,
    calls: Arc<AtomicUsize>,
}

impl ScriptedValidator {
    pub fn passing() -> Self {
        Self {
            passes: true,
            output: "all checks passed".to_string(),
            calls: Arc::default(),
        }
    }

    pub fn failing(output: &str) -> Self {
        Self {
            passes: false,
            output: output.to_string(),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, _request: &ValidationRequest) -> Result<ValidationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationOutcome {
            passed: self.passes,
            timed_out: false,
            exit_code: Some(if self.passes { 0 } else { 1 }),
            output: self.output.clone(),
        })
    }
}

/// Scripted executor and validator with default prompt building and no-op collaborators.
pub fn collaborators(
    executor: Arc<ScriptedExecutor>,
    validator: Arc<ScriptedValidator>,
) -> Collaborators {
    Collaborators {
        executor,
        validator,
        context: Arc::new(TemplateContextBuilder::new()),
        memory: Arc::new(NoopMemory),
        issues: Arc::new(NoopIssueTracker),
    }
}

/// Temporary git repository with a configured identity.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q"]);
        repo.git_cmd(&["config", "user.email", "runner@example.com"]);
        repo.git_cmd(&["config", "user.name", "Story Runner Tests"]);
        repo.git_cmd(&["config", "commit.gpgsign", "false"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn commit(&self, message: &str) {
        self.git_cmd(&["add", "-A"]);
        self.git_cmd(&["commit", "-q", "--allow-empty", "-m", message]);
    }

    /// `init`, write `stories`, and commit the scaffolding.
    pub fn init_with_stories(&self, stories: Vec<Story>) -> RunnerPaths {
        if !self.path().join("README.md").exists() {
            self.write("README.md", "test project\n");
        }
        let paths = init_runner(self.path(), &InitOptions { force: false }).expect("init");
        let prd = Prd {
            project: "test-project".to_string(),
            stories,
        };
        write_prd(&paths.prd_path, &prd).expect("write prd");
        self.commit("scaffold");
        paths
    }

    fn git_cmd(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {} failed", args.join(" "));
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
