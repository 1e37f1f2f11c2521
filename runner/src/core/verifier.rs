//! Output verification gate.
//!
//! Decides whether a validation-passing iteration is substantive enough to
//! commit. Every check is an independent heuristic over data already captured
//! (diff statistics, tool calls, the agent summary, activity counts); none of
//! them touch the network or the filesystem.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::activity::ActivityStats;
use crate::core::types::{AgentReport, Severity, Story, VerificationCheck};

const MIN_SUMMARY_CHARS: usize = 20;
const TRIVIAL_MAX_LINES: u64 = 4;
const MIN_KEY_TERM_LEN: usize = 4;
const MIN_KEY_TERMS: usize = 3;
const MIN_TERM_COVERAGE: f64 = 0.2;
const MAX_LISTED_TERMS: usize = 5;
const EXPLORATION_LIMIT: u32 = 5;
const REVIEW_WARNING_THRESHOLD: usize = 3;

const CONFIG_DOC_EXTENSIONS: &[&str] = &[
    "md", "mdx", "txt", "rst", "json", "jsonc", "yaml", "yml", "toml", "ini", "cfg", "conf",
    "lock", "env", "xml", "properties",
];

const CONFIG_DOC_FILENAMES: &[&str] = &[
    ".gitignore",
    ".gitattributes",
    ".editorconfig",
    ".npmrc",
    ".nvmrc",
    ".prettierrc",
    ".eslintrc",
    ".env",
    "dockerfile",
    "makefile",
    "license",
];

const STOP_WORDS: &[&str] = &[
    "that", "this", "with", "from", "have", "should", "must", "will", "when", "then", "than",
    "into", "onto", "each", "every", "some", "only", "also", "been", "being", "were", "they",
    "them", "their", "there", "which", "while", "where", "what", "about", "after", "before",
    "able", "does", "make", "sure", "user", "users", "using", "used", "work", "works", "correctly",
    "properly", "ensure", "allow", "allows", "supports", "support", "like", "more", "most", "such",
    "these", "those", "other", "same", "just", "over", "under", "your", "none", "true", "false",
];

static TEST_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)((^|/)(tests?|__tests__|specs?|e2e)/|\.(test|spec)\.[a-z0-9]+$|(^|/)test_[^/]+$|_(test|spec)\.[a-z0-9]+$)",
    )
    .expect("test file pattern should be valid")
});

static CONFIG_STORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(config|configure|configuration|setup|set up|infra|infrastructure|ci|cd|pipeline|docker|deploy|deployment|dependency|dependencies|docs?|documentation|readme|changelog|env|environment|tooling|scaffold|lint|linting|formatting)\b",
    )
    .expect("config story pattern should be valid")
});

static LAZY_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(done|completed?|fixed|finished|implemented|updated|all done|task (is )?(done|complete|completed)|story (is )?(done|complete|completed)|work (is )?(done|complete|completed)|changes (made|applied)|implementation complete|task completed successfully|everything (is )?(done|working))[.!]*\s*$",
    )
    .expect("lazy summary pattern should be valid")
});

/// Diff statistics between the pre-iteration commit and the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub files_changed: u32,
    pub insertions: u64,
    pub deletions: u64,
    pub files: Vec<String>,
}

impl DiffStats {
    pub fn changed_lines(&self) -> u64 {
        self.insertions + self.deletions
    }
}

/// Everything the verifier inspects for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct VerifyInput<'a> {
    pub story: &'a Story,
    pub diff: &'a DiffStats,
    pub diff_content: &'a str,
    pub tool_calls: u32,
    /// Files the agent reported modifying in its event stream.
    pub files_modified: &'a [String],
    pub summary: Option<&'a str>,
    pub report: Option<&'a AgentReport>,
    pub validation_passed: bool,
    pub activity: Option<&'a ActivityStats>,
}

/// Aggregated verification decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// No `Reject` check fired.
    pub passed: bool,
    /// Enough warnings fired that a heavier review is advisable.
    pub requires_review: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationReport {
    fn from_checks(checks: Vec<VerificationCheck>) -> Self {
        let passed = !checks.iter().any(|c| c.severity == Severity::Reject);
        let warnings = checks
            .iter()
            .filter(|c| c.severity == Severity::Warn)
            .count();
        Self {
            passed,
            requires_review: warnings >= REVIEW_WARNING_THRESHOLD,
            checks,
        }
    }

    pub fn rejections(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| c.severity == Severity::Reject)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| c.severity == Severity::Warn)
    }

    /// `name: message` lines for each warning.
    pub fn warning_lines(&self) -> Vec<String> {
        self.warnings()
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect()
    }

    /// Concatenated reject messages, or `None` when verification passed.
    pub fn reject_reason(&self) -> Option<String> {
        let messages: Vec<&str> = self.rejections().map(|c| c.message.as_str()).collect();
        if messages.is_empty() {
            None
        } else {
            Some(messages.join("; "))
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.checks.iter().any(|c| c.name == name)
    }
}

type Check = fn(&VerifyInput<'_>) -> Option<VerificationCheck>;

const CHECKS: &[Check] = &[
    check_empty_diff,
    check_zero_tool_calls,
    check_no_tests,
    check_config_only,
    check_trivial_diff,
    check_acceptance_criteria,
    check_self_reported_failure,
    check_lazy_summary,
    check_heavy_exploration,
];

/// Run every check and aggregate into a [`VerificationReport`].
pub fn verify(input: &VerifyInput<'_>) -> VerificationReport {
    let checks = CHECKS.iter().filter_map(|check| check(input)).collect();
    VerificationReport::from_checks(checks)
}

fn reject(name: &'static str, message: impl Into<String>) -> Option<VerificationCheck> {
    Some(VerificationCheck {
        name,
        severity: Severity::Reject,
        message: message.into(),
    })
}

fn warn(name: &'static str, message: impl Into<String>) -> Option<VerificationCheck> {
    Some(VerificationCheck {
        name,
        severity: Severity::Warn,
        message: message.into(),
    })
}

fn check_empty_diff(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    if input.files_modified.is_empty() && input.diff.files_changed == 0 {
        return reject("empty_diff", "no files were modified");
    }
    None
}

fn check_zero_tool_calls(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    if input.tool_calls == 0 {
        return reject("zero_tool_calls", "the agent made no tool calls");
    }
    None
}

fn check_no_tests(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    if is_config_story(input.story) || all_config_or_doc(&input.diff.files) {
        return None;
    }
    if input.diff.files.iter().any(|f| is_test_file(f)) {
        return None;
    }
    warn("no_tests", "no test files were added or changed")
}

fn check_config_only(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    if input.diff.files.is_empty() || is_config_story(input.story) {
        return None;
    }
    if all_config_or_doc(&input.diff.files) {
        return warn(
            "config_only",
            format!(
                "only config/doc files changed ({}) for a code story",
                input.diff.files.len()
            ),
        );
    }
    None
}

fn check_trivial_diff(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    let lines = input.diff.changed_lines();
    if input.diff.files_changed >= 1 && (1..=TRIVIAL_MAX_LINES).contains(&lines) {
        return warn(
            "trivial_diff",
            format!("only {lines} line(s) changed"),
        );
    }
    None
}

fn check_acceptance_criteria(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    let terms = key_terms(&input.story.acceptance_criteria);
    if terms.len() < MIN_KEY_TERMS {
        return None;
    }
    let mut haystack = input.diff_content.to_lowercase();
    if let Some(summary) = input.summary {
        haystack.push('\n');
        haystack.push_str(&summary.to_lowercase());
    }
    let missing: Vec<&String> = terms.iter().filter(|t| !haystack.contains(t.as_str())).collect();
    let found = terms.len() - missing.len();
    let coverage = found as f64 / terms.len() as f64;
    if coverage >= MIN_TERM_COVERAGE {
        return None;
    }
    let listed: Vec<&str> = missing
        .iter()
        .take(MAX_LISTED_TERMS)
        .map(|t| t.as_str())
        .collect();
    warn(
        "acceptance_criteria_miss",
        format!(
            "{found}/{} acceptance terms found; missing: {}",
            terms.len(),
            listed.join(", ")
        ),
    )
}

fn check_self_reported_failure(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    let claimed_failure = input.report.and_then(|r| r.success) == Some(false);
    if claimed_failure && input.validation_passed {
        return warn(
            "self_reported_failure",
            "the agent reported failure although validation passed",
        );
    }
    None
}

fn check_lazy_summary(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    let summary = input.summary.map(str::trim).unwrap_or_default();
    if summary.is_empty() {
        return warn("lazy_summary", "no summary was provided");
    }
    if summary.chars().count() < MIN_SUMMARY_CHARS {
        return warn(
            "lazy_summary",
            format!("summary is too short ({} chars)", summary.chars().count()),
        );
    }
    if LAZY_SUMMARY.is_match(summary) {
        return warn("lazy_summary", format!("summary is a canned phrase: {summary:?}"));
    }
    None
}

fn check_heavy_exploration(input: &VerifyInput<'_>) -> Option<VerificationCheck> {
    let stats = input.activity?;
    if stats.explorations > EXPLORATION_LIMIT && stats.writes == 0 {
        return warn(
            "heavy_exploration_no_writes",
            format!("{} explorations and no file writes", stats.explorations),
        );
    }
    None
}

/// True when the story text reads as config/infra work.
pub fn is_config_story(story: &Story) -> bool {
    CONFIG_STORY.is_match(&story.title) || CONFIG_STORY.is_match(&story.description)
}

pub fn is_test_file(path: &str) -> bool {
    TEST_FILE.is_match(path)
}

pub fn is_config_or_doc(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    if CONFIG_DOC_FILENAMES.contains(&name.as_str()) {
        return true;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => CONFIG_DOC_EXTENSIONS.contains(&ext),
        _ => false,
    }
}

fn all_config_or_doc(files: &[String]) -> bool {
    !files.is_empty() && files.iter().all(|f| is_config_or_doc(f))
}

/// Distinct lower-cased words of length >= 4 that are not stop words.
pub fn key_terms(criteria: &[String]) -> BTreeSet<String> {
    criteria
        .iter()
        .flat_map(|c| c.split(|ch: char| !ch.is_alphanumeric() && ch != '_'))
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_KEY_TERM_LEN && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::story;

    fn diff(files: &[&str], insertions: u64, deletions: u64) -> DiffStats {
        DiffStats {
            files_changed: files.len() as u32,
            insertions,
            deletions,
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    struct Fixture {
        story: Story,
        diff: DiffStats,
        diff_content: String,
        tool_calls: u32,
        files_modified: Vec<String>,
        summary: Option<String>,
        report: Option<AgentReport>,
        activity: Option<ActivityStats>,
    }

    impl Fixture {
        fn substantive() -> Self {
            Self {
                story: story("parser", 1),
                diff: diff(&["src/parser.ts", "src/parser.test.ts"], 40, 3),
                diff_content: "+export function parse() {}".to_string(),
                tool_calls: 12,
                files_modified: vec!["src/parser.ts".to_string()],
                summary: Some("Added a recursive descent parser with tests".to_string()),
                report: None,
                activity: None,
            }
        }

        fn run(&self) -> VerificationReport {
            verify(&VerifyInput {
                story: &self.story,
                diff: &self.diff,
                diff_content: &self.diff_content,
                tool_calls: self.tool_calls,
                files_modified: &self.files_modified,
                summary: self.summary.as_deref(),
                report: self.report.as_ref(),
                validation_passed: true,
                activity: self.activity.as_ref(),
            })
        }
    }

    #[test]
    fn substantive_change_passes_without_warnings() {
        let report = Fixture::substantive().run();
        assert!(report.passed);
        assert!(report.checks.is_empty(), "{:?}", report.checks);
        assert!(!report.requires_review);
        assert_eq!(report.reject_reason(), None);
    }

    #[test]
    fn empty_run_rejects_with_both_checks() {
        let mut fixture = Fixture::substantive();
        fixture.diff = DiffStats::default();
        fixture.files_modified.clear();
        fixture.tool_calls = 0;
        let report = fixture.run();
        assert!(!report.passed);
        assert!(report.has("empty_diff"));
        assert!(report.has("zero_tool_calls"));
        let reason = report.reject_reason().expect("reason");
        assert!(reason.contains("no files were modified"));
        assert!(reason.contains("no tool calls"));
    }

    #[test]
    fn agent_reported_files_avoid_empty_diff() {
        let mut fixture = Fixture::substantive();
        fixture.diff = DiffStats::default();
        let report = fixture.run();
        assert!(!report.has("empty_diff"));
    }

    #[test]
    fn missing_tests_warn_for_code_story() {
        let mut fixture = Fixture::substantive();
        fixture.diff = diff(&["src/parser.ts"], 40, 0);
        let report = fixture.run();
        assert!(report.passed);
        assert!(report.has("no_tests"));
    }

    #[test]
    fn config_story_skips_test_and_config_only_checks() {
        let mut fixture = Fixture::substantive();
        fixture.story.title = "Configure CI pipeline".to_string();
        fixture.diff = diff(&[".github/workflows/ci.yml", "package.json"], 20, 2);
        let report = fixture.run();
        assert!(!report.has("no_tests"));
        assert!(!report.has("config_only"));
    }

    #[test]
    fn config_only_change_warns_for_code_story() {
        let mut fixture = Fixture::substantive();
        fixture.diff = diff(&["README.md", "package.json"], 20, 2);
        let report = fixture.run();
        assert!(report.has("config_only"));
        assert!(!report.has("no_tests"));
    }

    #[test]
    fn trivial_diff_bounds() {
        for (lines, expected) in [(1, true), (4, true), (5, false)] {
            let mut fixture = Fixture::substantive();
            fixture.diff = diff(&["src/a.ts", "src/a.test.ts"], lines, 0);
            assert_eq!(fixture.run().has("trivial_diff"), expected, "lines {lines}");
        }
        let mut fixture = Fixture::substantive();
        fixture.diff = diff(&["src/a.ts"], 0, 0);
        assert!(!fixture.run().has("trivial_diff"));
    }

    #[test]
    fn acceptance_terms_missing_from_diff_warn() {
        let mut fixture = Fixture::substantive();
        fixture.story.acceptance_criteria = vec![
            "Exports a tokenizer function".to_string(),
            "Handles unicode identifiers".to_string(),
            "Reports line numbers in diagnostics".to_string(),
        ];
        let report = fixture.run();
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "acceptance_criteria_miss")
            .expect("criteria check");
        assert!(check.message.starts_with("1/10"), "{}", check.message);
        assert!(check.message.matches(", ").count() <= MAX_LISTED_TERMS - 1);
    }

    #[test]
    fn acceptance_terms_present_in_summary_pass() {
        let mut fixture = Fixture::substantive();
        fixture.story.acceptance_criteria =
            vec!["Parser handles nested expressions and reports errors".to_string()];
        fixture.summary = Some("Parser now handles nested expressions".to_string());
        assert!(!fixture.run().has("acceptance_criteria_miss"));
    }

    #[test]
    fn too_few_terms_skip_acceptance_check() {
        let mut fixture = Fixture::substantive();
        fixture.story.acceptance_criteria = vec!["It works with them".to_string()];
        assert!(key_terms(&fixture.story.acceptance_criteria).len() < MIN_KEY_TERMS);
        assert!(!fixture.run().has("acceptance_criteria_miss"));
    }

    #[test]
    fn self_reported_failure_warns() {
        let mut fixture = Fixture::substantive();
        fixture.report = Some(AgentReport {
            success: Some(false),
            summary: "could not finish".to_string(),
        });
        assert!(fixture.run().has("self_reported_failure"));
    }

    #[test]
    fn lazy_summaries_warn() {
        for summary in [None, Some("ok"), Some("Done."), Some("Task completed successfully.")] {
            let mut fixture = Fixture::substantive();
            fixture.summary = summary.map(str::to_string);
            assert!(fixture.run().has("lazy_summary"), "summary {summary:?}");
        }
    }

    #[test]
    fn heavy_exploration_without_writes_warns() {
        let mut fixture = Fixture::substantive();
        fixture.activity = Some(ActivityStats {
            explorations: 6,
            writes: 0,
            ..ActivityStats::default()
        });
        assert!(fixture.run().has("heavy_exploration_no_writes"));
        fixture.activity = Some(ActivityStats {
            explorations: 6,
            writes: 1,
            ..ActivityStats::default()
        });
        assert!(!fixture.run().has("heavy_exploration_no_writes"));
    }

    #[test]
    fn three_warnings_require_review() {
        let mut fixture = Fixture::substantive();
        fixture.diff = diff(&["src/a.ts"], 2, 0);
        fixture.summary = Some("done".to_string());
        let report = fixture.run();
        assert!(report.passed);
        assert_eq!(report.warnings().count(), 3);
        assert!(report.requires_review);
    }

    #[test]
    fn classifies_paths() {
        assert!(is_test_file("src/__tests__/a.ts"));
        assert!(is_test_file("tests/integration.rs"));
        assert!(is_test_file("src/parser.spec.ts"));
        assert!(is_test_file("pkg/parser_test.go"));
        assert!(is_test_file("test_parser.py"));
        assert!(!is_test_file("src/contest.ts"));
        assert!(is_config_or_doc("docs/guide.md"));
        assert!(is_config_or_doc(".gitignore"));
        assert!(is_config_or_doc("Cargo.lock"));
        assert!(!is_config_or_doc("src/main.rs"));
    }
}
