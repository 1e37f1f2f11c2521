//! Story file (`.runner/prd.json`) load/save with schema validation.
//!
//! Stories are never deleted; they are added, edited, and marked complete.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::types::Story;
use crate::io::config::write_atomic;

const PRD_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/prd.schema.json"
));

static PRD_VALIDATOR: LazyLock<std::result::Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PRD_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// Story list for one working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prd {
    #[serde(default)]
    pub project: String,
    pub stories: Vec<Story>,
}

impl Prd {
    pub fn empty(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stories: Vec::new(),
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    fn story_mut(&mut self, id: &str) -> Result<&mut Story> {
        self.stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("unknown story id '{id}'"))
    }
}

/// Editable story fields. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct StoryPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub validation_command: Option<Option<String>>,
}

/// Load and validate the story file (schema + unique ids).
pub fn load_prd(path: &Path) -> Result<Prd> {
    if !path.exists() {
        return Err(anyhow!(
            "no prd found at {} (run `story-runner init`)",
            path.display()
        ));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read prd {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse prd {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate prd {}", path.display()))?;
    let prd: Prd = serde_json::from_value(value)
        .with_context(|| format!("deserialize prd {}", path.display()))?;
    validate_unique_ids(&prd)?;
    debug!(path = %path.display(), stories = prd.stories.len(), "prd loaded");
    Ok(prd)
}

/// Atomically write the story file.
pub fn write_prd(path: &Path, prd: &Prd) -> Result<()> {
    validate_unique_ids(prd)?;
    let mut buf = serde_json::to_string_pretty(prd).context("serialize prd")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Set the completion flag of `id` and persist. Idempotent.
pub fn mark_story_complete(path: &Path, id: &str) -> Result<()> {
    let mut prd = load_prd(path)?;
    let story = prd.story_mut(id)?;
    if story.complete {
        return Ok(());
    }
    story.complete = true;
    write_prd(path, &prd)
}

/// Append a new story; ids must be unique.
pub fn add_story(path: &Path, story: Story) -> Result<()> {
    let mut prd = load_prd(path)?;
    if prd.story(&story.id).is_some() {
        return Err(anyhow!("story id '{}' already exists", story.id));
    }
    prd.stories.push(story);
    write_prd(path, &prd)
}

/// Apply `patch` to story `id` and persist.
pub fn update_story(path: &Path, id: &str, patch: StoryPatch) -> Result<Story> {
    let mut prd = load_prd(path)?;
    let story = prd.story_mut(id)?;
    if let Some(title) = patch.title {
        story.title = title;
    }
    if let Some(description) = patch.description {
        story.description = description;
    }
    if let Some(priority) = patch.priority {
        story.priority = priority;
    }
    if let Some(criteria) = patch.acceptance_criteria {
        story.acceptance_criteria = criteria;
    }
    if let Some(command) = patch.validation_command {
        story.validation_command = command;
    }
    let updated = story.clone();
    write_prd(path, &prd)?;
    Ok(updated)
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = PRD_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid prd schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "prd schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_unique_ids(prd: &Prd) -> Result<()> {
    let mut seen = HashSet::new();
    for story in &prd.stories {
        if !seen.insert(story.id.as_str()) {
            return Err(anyhow!("duplicate story id '{}'", story.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::story;

    fn write_sample(path: &Path) {
        let prd = Prd {
            project: "demo".to_string(),
            stories: vec![story("a", 1), story("b", 2)],
        };
        write_prd(path, &prd).expect("write");
    }

    #[test]
    fn missing_file_is_no_prd_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_prd(&temp.path().join("prd.json")).unwrap_err();
        assert!(err.to_string().contains("no prd found"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        write_sample(&path);
        let prd = load_prd(&path).expect("load");
        assert_eq!(prd.project, "demo");
        assert_eq!(prd.stories.len(), 2);
    }

    #[test]
    fn schema_rejects_missing_title() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        fs::write(&path, r#"{"stories":[{"id":"a"}]}"#).expect("write");
        let err = load_prd(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        fs::write(
            &path,
            r#"{"stories":[{"id":"a","title":"A"},{"id":"a","title":"B"}]}"#,
        )
        .expect("write");
        let err = load_prd(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate story id"));
    }

    #[test]
    fn mark_complete_persists_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        write_sample(&path);
        mark_story_complete(&path, "b").expect("mark");
        mark_story_complete(&path, "b").expect("mark again");
        let prd = load_prd(&path).expect("load");
        assert!(!prd.story("a").expect("a").complete);
        assert!(prd.story("b").expect("b").complete);
        assert!(mark_story_complete(&path, "zzz").is_err());
    }

    #[test]
    fn add_and_update_story() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        write_sample(&path);

        add_story(&path, story("c", 0)).expect("add");
        assert!(add_story(&path, story("c", 0)).is_err());

        let updated = update_story(
            &path,
            "c",
            StoryPatch {
                priority: Some(7),
                acceptance_criteria: Some(vec!["renders a table".to_string()]),
                validation_command: Some(Some("cargo test".to_string())),
                ..StoryPatch::default()
            },
        )
        .expect("update");
        assert_eq!(updated.priority, 7);
        let prd = load_prd(&path).expect("load");
        let c = prd.story("c").expect("c");
        assert_eq!(c.acceptance_criteria, vec!["renders a table"]);
        assert_eq!(c.validation_command.as_deref(), Some("cargo test"));
    }
}
