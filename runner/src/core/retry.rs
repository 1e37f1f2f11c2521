//! Per-story retry bookkeeping and skip policy.
//!
//! Two implementations share one counting rule: a failure is an iteration row
//! whose story id equals the target exactly and whose `success` is false.
//! [`RetryTracker`] keeps counters in memory for one job run; the free
//! functions rebuild the same numbers from durable log rows on a cold start.

use std::collections::HashMap;

use crate::core::types::IterationResult;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Attempt and failure counters for one story. `failures <= attempts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub failures: u32,
}

/// Observable retry decision for a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep attempting the story.
    Retry,
    /// Failures reached the configured maximum.
    Skip,
    /// The story is already complete.
    Complete,
}

/// In-memory retry table scoped to one job run.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    states: HashMap<String, RetryState>,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            states: HashMap::new(),
        }
    }

    /// Rebuild the tracker from previously recorded iteration results.
    pub fn from_results<'a, I>(max_retries: u32, results: I) -> Self
    where
        I: IntoIterator<Item = &'a IterationResult>,
    {
        let mut tracker = Self::new(max_retries);
        for result in results {
            tracker.record_attempt(&result.story_id, result.success);
        }
        tracker
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn record_attempt(&mut self, story_id: &str, success: bool) {
        let state = self.states.entry(story_id.to_string()).or_default();
        state.attempts += 1;
        if !success {
            state.failures += 1;
        }
    }

    pub fn state(&self, story_id: &str) -> RetryState {
        self.states.get(story_id).copied().unwrap_or_default()
    }

    pub fn failures(&self, story_id: &str) -> u32 {
        self.state(story_id).failures
    }

    pub fn should_skip(&self, story_id: &str) -> bool {
        exceeds_limit(self.failures(story_id), self.max_retries)
    }

    pub fn decide(&self, story_id: &str, complete: bool) -> RetryDecision {
        if complete {
            RetryDecision::Complete
        } else if self.should_skip(story_id) {
            RetryDecision::Skip
        } else {
            RetryDecision::Retry
        }
    }
}

/// Count failed rows for `story_id` without any in-memory state.
pub fn failure_count<'a, I>(results: I, story_id: &str) -> u32
where
    I: IntoIterator<Item = &'a IterationResult>,
{
    state_from_results(results, story_id).failures
}

/// Rebuild the full [`RetryState`] for `story_id` from recorded rows.
pub fn state_from_results<'a, I>(results: I, story_id: &str) -> RetryState
where
    I: IntoIterator<Item = &'a IterationResult>,
{
    results
        .into_iter()
        .filter(|result| result.story_id == story_id)
        .fold(RetryState::default(), |mut state, result| {
            state.attempts += 1;
            if !result.success {
                state.failures += 1;
            }
            state
        })
}

/// Stateless skip check over recorded rows.
pub fn should_skip_from_results<'a, I>(results: I, story_id: &str, max_retries: u32) -> bool
where
    I: IntoIterator<Item = &'a IterationResult>,
{
    exceeds_limit(failure_count(results, story_id), max_retries)
}

fn exceeds_limit(failures: u32, max_retries: u32) -> bool {
    failures >= max_retries
}
