//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between the iteration runner, the job
//! engine and the durable iteration log. They carry no I/O and serialize to the
//! same JSON shape the log stores on disk.

use serde::{Deserialize, Serialize};

/// One discrete, independently validatable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower runs sooner.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, alias = "passes")]
    pub complete: bool,
    /// Overrides the configured validation command for this story.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    /// External issue tracker reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

/// Structured final message an agent may write to its output file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub summary: String,
}

/// Categories assigned to failing validation output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    TypeError,
    LintError,
    TestFailure,
    BuildError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TypeError => "type_error",
            Self::LintError => "lint_error",
            Self::TestFailure => "test_failure",
            Self::BuildError => "build_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Terminal outcome of a single iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Validation and verification passed and the change was recorded.
    Committed,
    ValidationFailed,
    VerificationRejected,
    /// The hard wall-clock bound expired.
    TimedOut,
    /// No progress event arrived within the stall window.
    Stalled,
    /// The agent exited with a non-zero status.
    AgentFailed,
    SpawnFailed,
    /// The runner itself failed (e.g. could not write the prompt).
    InternalError,
}

impl IterationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::ValidationFailed => "validation_failed",
            Self::VerificationRejected => "verification_rejected",
            Self::TimedOut => "timed_out",
            Self::Stalled => "stalled",
            Self::AgentFailed => "agent_failed",
            Self::SpawnFailed => "spawn_failed",
            Self::InternalError => "internal_error",
        }
    }
}

/// Outcome of one iteration. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub success: bool,
    pub story_id: String,
    pub outcome: IterationOutcome,
    pub validation_passed: bool,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Tail of the captured agent/validation output.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub verification_passed: Option<bool>,
    #[serde(default)]
    pub verification_warnings: Vec<String>,
    /// Enough verification warnings piled up that a human should look.
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default)]
    pub failure_category: Option<FailureCategory>,
}

/// Verification severity: `Reject` blocks the commit, `Warn` is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Reject,
    Warn,
}

/// A single fired verification check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub name: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// Job lifecycle. `Running` is initial; the others are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Keep at most `max_chars` trailing characters of `text`.
///
/// The tail is kept because failures are usually reported last.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let kept: String = text.chars().skip(skip).collect();
    format!("[... {skip} chars truncated]\n{kept}")
}
