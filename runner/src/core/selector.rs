//! Deterministic story selection.

use std::collections::HashSet;

use crate::core::retry::RetryTracker;
use crate::core::types::Story;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// No incomplete story remains that has not been excluded.
    AllDone,
    /// Next story to run.
    Run(&'a Story),
    /// Next story by priority, but its failures reached the retry limit.
    Skip { story: &'a Story, failures: u32 },
}

/// First incomplete story by ascending priority, ignoring `excluded` ids.
///
/// Ties keep file order.
pub fn next_story<'a>(stories: &'a [Story], excluded: &HashSet<String>) -> Option<&'a Story> {
    stories
        .iter()
        .filter(|story| !story.complete && !excluded.contains(&story.id))
        .min_by_key(|story| story.priority)
}

/// Select the next story and apply the retry skip policy.
pub fn select<'a>(
    stories: &'a [Story],
    excluded: &HashSet<String>,
    tracker: &RetryTracker,
) -> Selection<'a> {
    match next_story(stories, excluded) {
        None => Selection::AllDone,
        Some(story) if tracker.should_skip(&story.id) => Selection::Skip {
            story,
            failures: tracker.failures(&story.id),
        },
        Some(story) => Selection::Run(story),
    }
}

/// Count of stories still marked incomplete.
pub fn remaining(stories: &[Story]) -> usize {
    stories.iter().filter(|story| !story.complete).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::story;

    #[test]
    fn picks_lowest_priority_incomplete() {
        let mut done = story("done", 0);
        done.complete = true;
        let stories = vec![done, story("late", 5), story("soon", 1), story("also-soon", 1)];
        let picked = next_story(&stories, &HashSet::new()).expect("story");
        assert_eq!(picked.id, "soon");
    }

    #[test]
    fn excluded_ids_are_passed_over() {
        let stories = vec![story("a", 1), story("b", 2)];
        let excluded = HashSet::from(["a".to_string()]);
        assert_eq!(next_story(&stories, &excluded).expect("story").id, "b");
    }

    #[test]
    fn select_reports_skip_when_failures_reach_limit() {
        let stories = vec![story("a", 1), story("b", 2)];
        let mut tracker = RetryTracker::new(2);
        tracker.record_attempt("a", false);
        tracker.record_attempt("a", false);
        let selection = select(&stories, &HashSet::new(), &tracker);
        assert_eq!(
            selection,
            Selection::Skip {
                story: &stories[0],
                failures: 2
            }
        );
    }

    #[test]
    fn select_all_done_when_everything_complete() {
        let mut a = story("a", 1);
        a.complete = true;
        let stories = vec![a];
        let tracker = RetryTracker::new(3);
        assert_eq!(
            select(&stories, &HashSet::new(), &tracker),
            Selection::AllDone
        );
        assert_eq!(remaining(&stories), 0);
    }
}
