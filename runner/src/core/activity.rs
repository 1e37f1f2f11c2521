//! Behavioral statistics derived from the agent's diagnostic output.
//!
//! Each line is tested against an ordered table of regex families. A line may
//! count toward several families (e.g. `cat > file` both reads and writes).

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Exploration,
    Write,
    TestRun,
    Error,
    ToolInvocation,
}

static PATTERNS: LazyLock<Vec<(ActivityKind, Regex)>> = LazyLock::new(|| {
    let table = [
        (
            ActivityKind::Exploration,
            r"(?i)\b(ls|find|grep|rg|cat|head|tail|tree|less|glob|read_file|sed\s+-n)\b",
        ),
        (
            ActivityKind::Write,
            r"(?i)\b(write_file|edit_file|apply_patch|create_file|write|edit|patch|touch|mkdir|tee|mv|cp)\b|\s>>?\s*\S",
        ),
        (
            ActivityKind::TestRun,
            r"(?i)\b(jest|vitest|pytest|mocha|cargo\s+test|bun\s+test|npm\s+(run\s+)?test|go\s+test|tests?)\b",
        ),
        (
            ActivityKind::Error,
            r"(?i)\b(error|errors|failed|failure|exception|panic(ked)?|traceback)\b",
        ),
        (
            ActivityKind::ToolInvocation,
            r"(?i)(\btool(_use|_call)?\s*[:=(]|\[tool\]|calling tool|\bexec(uting)?\s*:)",
        ),
    ];
    table
        .into_iter()
        .map(|(kind, pattern)| {
            (
                kind,
                Regex::new(pattern).expect("activity pattern should be valid"),
            )
        })
        .collect()
});

/// Kinds matched by one line, in table order.
pub fn classify_line(line: &str) -> Vec<ActivityKind> {
    PATTERNS
        .iter()
        .filter(|(_, regex)| regex.is_match(line))
        .map(|(kind, _)| *kind)
        .collect()
}

/// Snapshot of accumulated activity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityStats {
    pub lines: u32,
    pub explorations: u32,
    pub writes: u32,
    pub test_runs: u32,
    pub errors: u32,
    pub tool_invocations: u32,
    /// Milliseconds from monitor start to the first tool invocation.
    pub first_tool_ms: Option<u64>,
}

impl ActivityStats {
    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        let first_tool = match self.first_tool_ms {
            Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
            None => "never".to_string(),
        };
        format!(
            "tools={} explore={} write={} tests={} errors={} first_tool={}",
            self.tool_invocations,
            self.explorations,
            self.writes,
            self.test_runs,
            self.errors,
            first_tool
        )
    }

    /// Guidance for the next attempt, when the pattern of activity suggests one.
    pub fn feedback(&self) -> Option<String> {
        let mut notes = Vec::new();
        if self.explorations > 5 && self.writes == 0 {
            notes.push(format!(
                "The previous attempt explored {} times without writing any file. Start making changes sooner.",
                self.explorations
            ));
        }
        if self.writes > 0 && self.test_runs == 0 {
            notes.push("The previous attempt never ran the tests. Run them before finishing.".to_string());
        }
        if self.errors > 10 {
            notes.push(format!(
                "The previous attempt hit {} errors. Read the first error carefully before retrying.",
                self.errors
            ));
        }
        if notes.is_empty() {
            None
        } else {
            Some(notes.join("\n"))
        }
    }
}

/// Accumulates [`ActivityStats`] from diagnostic lines.
#[derive(Debug, Clone, Default)]
pub struct ActivityMonitor {
    stats: ActivityStats,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one line observed `elapsed` after the monitor started.
    pub fn observe(&mut self, line: &str, elapsed: Duration) {
        if line.trim().is_empty() {
            return;
        }
        self.stats.lines += 1;
        for kind in classify_line(line) {
            match kind {
                ActivityKind::Exploration => self.stats.explorations += 1,
                ActivityKind::Write => self.stats.writes += 1,
                ActivityKind::TestRun => self.stats.test_runs += 1,
                ActivityKind::Error => self.stats.errors += 1,
                ActivityKind::ToolInvocation => {
                    self.stats.tool_invocations += 1;
                    if self.stats.first_tool_ms.is_none() {
                        self.stats.first_tool_ms = Some(elapsed.as_millis() as u64);
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> ActivityStats {
        self.stats
    }
}
