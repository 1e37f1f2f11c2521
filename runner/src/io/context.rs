//! Prompt construction for one iteration.
//!
//! [`ContextBuilder`] is the seam for alternative prompt assembly; the default
//! [`TemplateContextBuilder`] renders an embedded minijinja template.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{FailureCategory, IterationOutcome, Story, tail_chars};

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Characters of previous output carried into the next prompt.
const PREVIOUS_OUTPUT_CHARS: usize = 2_000;

/// What the previous attempt at the same story left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousAttempt {
    pub outcome: IterationOutcome,
    pub failure_category: Option<FailureCategory>,
    pub reject_reason: Option<String>,
    pub output: String,
}

/// Inputs for building one prompt.
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub project: &'a str,
    pub story: &'a Story,
    /// 1-based attempt number for this story.
    pub attempt: u32,
    pub max_retries: u32,
    pub validation_command: &'a str,
    pub previous: Option<&'a PreviousAttempt>,
    pub activity_feedback: Option<&'a str>,
    pub memories: &'a [String],
}

pub trait ContextBuilder: Send + Sync {
    fn build(&self, input: &PromptInput<'_>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct PreviousContext<'a> {
    outcome: &'static str,
    failure_category: Option<&'static str>,
    reject_reason: Option<&'a str>,
    output: Option<String>,
}

/// Renders `prompts/iteration.md`.
pub struct TemplateContextBuilder {
    env: Environment<'static>,
}

impl TemplateContextBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .expect("iteration template should be valid");
        Self { env }
    }
}

impl Default for TemplateContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder for TemplateContextBuilder {
    fn build(&self, input: &PromptInput<'_>) -> Result<String> {
        let previous = input.previous.map(|prev| PreviousContext {
            outcome: prev.outcome.as_str(),
            failure_category: prev.failure_category.map(FailureCategory::as_str),
            reject_reason: prev.reject_reason.as_deref(),
            output: Some(prev.output.trim())
                .filter(|s| !s.is_empty())
                .map(|s| tail_chars(s, PREVIOUS_OUTPUT_CHARS)),
        });
        let template = self.env.get_template("iteration")?;
        let rendered = template
            .render(context! {
                project => input.project.trim(),
                story => input.story,
                attempt => input.attempt,
                max_retries => input.max_retries,
                validation_command => input
                    .story
                    .validation_command
                    .as_deref()
                    .unwrap_or(input.validation_command),
                previous => previous,
                activity_feedback => input.activity_feedback.map(str::trim).filter(|s| !s.is_empty()),
                memories => input.memories,
            })
            .context("render iteration prompt")?;
        debug!(
            story_id = %input.story.id,
            attempt = input.attempt,
            chars = rendered.len(),
            "prompt built"
        );
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::story;

    fn input<'a>(story: &'a Story, previous: Option<&'a PreviousAttempt>) -> PromptInput<'a> {
        PromptInput {
            project: "demo",
            story,
            attempt: 1,
            max_retries: 3,
            validation_command: "npm test",
            previous,
            activity_feedback: None,
            memories: &[],
        }
    }

    #[test]
    fn renders_story_and_criteria() {
        let mut s = story("login", 1);
        s.acceptance_criteria = vec!["Shows an error banner".to_string()];
        let prompt = TemplateContextBuilder::new()
            .build(&input(&s, None))
            .expect("render");
        assert!(prompt.contains("# Task: Implement login (login)"));
        assert!(prompt.contains("- Shows an error banner"));
        assert!(prompt.contains("attempt 1 of at most 3"));
        assert!(prompt.contains("`npm test`"));
        assert!(!prompt.contains("Previous attempt"));
    }

    #[test]
    fn story_validation_command_overrides_default() {
        let mut s = story("api", 1);
        s.validation_command = Some("cargo test".to_string());
        let prompt = TemplateContextBuilder::new()
            .build(&input(&s, None))
            .expect("render");
        assert!(prompt.contains("`cargo test`"));
    }

    #[test]
    fn includes_previous_attempt_and_feedback() {
        let s = story("api", 1);
        let previous = PreviousAttempt {
            outcome: IterationOutcome::ValidationFailed,
            failure_category: Some(FailureCategory::TypeError),
            reject_reason: None,
            output: "error TS2322: Type 'string' is not assignable".to_string(),
        };
        let memories = vec!["Use the shared http client".to_string()];
        let prompt = TemplateContextBuilder::new()
            .build(&PromptInput {
                attempt: 2,
                activity_feedback: Some("Start making changes sooner."),
                memories: &memories,
                ..input(&s, Some(&previous))
            })
            .expect("render");
        assert!(prompt.contains("outcome `validation_failed`"));
        assert!(prompt.contains("failure category: `type_error`"));
        assert!(prompt.contains("error TS2322"));
        assert!(prompt.contains("Start making changes sooner."));
        assert!(prompt.contains("- Use the shared http client"));
    }
}
