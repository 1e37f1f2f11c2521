//! Deterministic classification of failing validation output.
//!
//! Rules are data: an ordered table evaluated top to bottom against the
//! lower-cased text, first match wins. A lint message that also mentions
//! `assert` is a lint error because lint rules come before test rules.

use crate::core::types::FailureCategory;

/// A single classification rule.
enum Matcher {
    /// Any of these substrings.
    Any(&'static [&'static str]),
    /// All of these substrings.
    All(&'static [&'static str]),
}

impl Matcher {
    fn matches(&self, haystack: &str) -> bool {
        match self {
            Self::Any(needles) => needles.iter().any(|n| haystack.contains(n)),
            Self::All(needles) => needles.iter().all(|n| haystack.contains(n)),
        }
    }
}

const RULES: &[(FailureCategory, &[Matcher])] = &[
    (
        FailureCategory::Timeout,
        &[Matcher::Any(&["timeout", "exceeded 10 minutes", "timed out"])],
    ),
    (
        FailureCategory::TypeError,
        &[
            Matcher::Any(&["error ts", "ts(", "cannot find name"]),
            Matcher::All(&["type", "not assignable"]),
        ],
    ),
    (
        FailureCategory::LintError,
        &[Matcher::Any(&["eslint", "prettier", "lint"])],
    ),
    (
        FailureCategory::TestFailure,
        &[Matcher::Any(&[
            "assert",
            "expect(",
            "test fail",
            "tests failed",
            "test suites failed",
        ])],
    ),
    (
        FailureCategory::BuildError,
        &[Matcher::Any(&[
            "build fail",
            "bundle",
            "esbuild",
            "webpack",
            "rollup",
            "vite",
        ])],
    ),
];

/// Classify validation output into exactly one [`FailureCategory`].
pub fn classify_failure(output: &str) -> FailureCategory {
    let lower = output.to_lowercase();
    RULES
        .iter()
        .find(|(_, matchers)| matchers.iter().any(|m| m.matches(&lower)))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown)
}
