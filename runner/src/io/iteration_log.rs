//! Durable iteration artifacts under `.runner/`.
//!
//! - `iterations.jsonl`: append-only, one [`LogEntry`] per line. Each record is
//!   written with a single `write_all` behind a process-wide lock so entries from
//!   concurrent jobs interleave but never tear.
//! - `prompts/`: full prompt text addressed by content hash, with capped retention.
//! - `progress.md`: human-readable notes.
//!
//! These files are product output and are written regardless of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::IterationResult;
use crate::io::init::PROGRESS_HEADER;

static APPEND_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Hex characters of the prompt hash used in file names.
const PROMPT_FILE_HASH_LEN: usize = 16;

/// One line of `iterations.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: IterationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<String>,
}

/// Parsed log contents.
#[derive(Debug, Clone, Default)]
pub struct LogContents {
    pub entries: Vec<LogEntry>,
    /// Lines that failed to parse and were skipped.
    pub malformed: usize,
}

impl LogContents {
    pub fn results(&self) -> impl Iterator<Item = &IterationResult> {
        self.entries.iter().map(|entry| &entry.result)
    }
}

#[derive(Debug, Clone)]
pub struct IterationLog {
    path: PathBuf,
}

impl IterationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize log entry")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let _guard = APPEND_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open iteration log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append iteration log {}", self.path.display()))?;
        debug!(
            job_id = %entry.job_id,
            iteration = entry.iteration,
            story_id = %entry.result.story_id,
            "iteration logged"
        );
        Ok(())
    }

    /// Read every entry; a missing file is an empty log.
    pub fn read(&self) -> Result<LogContents> {
        if !self.path.exists() {
            return Ok(LogContents::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read iteration log {}", self.path.display()))?;
        let mut log = LogContents::default();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => log.entries.push(entry),
                Err(err) => {
                    debug!(%err, "skipping malformed log line");
                    log.malformed += 1;
                }
            }
        }
        if log.malformed > 0 {
            warn!(
                malformed = log.malformed,
                path = %self.path.display(),
                "iteration log has malformed lines"
            );
        }
        Ok(log)
    }
}

/// Content-addressed prompt files.
#[derive(Debug, Clone)]
pub struct PromptStore {
    dir: PathBuf,
    retention: usize,
}

/// Where a prompt was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPrompt {
    /// Full sha256 hex digest.
    pub hash: String,
    pub path: PathBuf,
}

impl PromptStore {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn persist(&self, prompt: &str) -> Result<StoredPrompt> {
        let hash = hex::encode(Sha256::digest(prompt.as_bytes()));
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create prompt dir {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("{}.md", &hash[..PROMPT_FILE_HASH_LEN]));
        fs::write(&path, prompt).with_context(|| format!("write prompt {}", path.display()))?;
        self.prune(&path);
        Ok(StoredPrompt { hash, path })
    }

    /// Delete the oldest prompt files beyond the retention cap, never `keep`.
    fn prune(&self, keep: &Path) {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "md") && path != keep)
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();
        let allowed = self.retention.saturating_sub(1);
        if files.len() <= allowed {
            return;
        }
        files.sort();
        let excess = files.len() - allowed;
        for (_, path) in files.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to prune prompt");
            }
        }
    }
}

/// Append-only human-readable notes in `progress.md`.
#[derive(Debug, Clone)]
pub struct ProgressNotes {
    path: PathBuf,
}

impl ProgressNotes {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one timestamped bullet. Failures are logged, not returned.
    pub fn note(&self, text: &str) {
        if let Err(err) = self.try_note(text) {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "failed to append progress note");
        }
    }

    fn try_note(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let mut buf = String::new();
        if !self.path.exists() {
            buf.push_str(PROGRESS_HEADER);
        }
        buf.push_str(&format!(
            "- {} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            text.trim()
        ));
        let _guard = APPEND_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::result;

    fn entry(job_id: &str, iteration: u32, story_id: &str, success: bool) -> LogEntry {
        let now = Utc::now();
        LogEntry {
            job_id: job_id.to_string(),
            iteration,
            started_at: now,
            finished_at: now,
            result: result(story_id, success),
            reject_reason: None,
            prompt_hash: Some("abc".to_string()),
            prompt_path: None,
        }
    }

    #[test]
    fn append_then_read_preserves_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = IterationLog::new(temp.path().join(".runner/iterations.jsonl"));
        log.append(&entry("job-1", 1, "a", false)).expect("append");
        log.append(&entry("job-1", 2, "a", true)).expect("append");

        let contents = log.read().expect("read");
        assert_eq!(contents.malformed, 0);
        assert_eq!(contents.entries.len(), 2);
        assert_eq!(contents.entries[0].iteration, 1);
        assert!(contents.entries[1].result.success);
    }

    #[test]
    fn entries_are_flat_json_objects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = IterationLog::new(temp.path().join("iterations.jsonl"));
        log.append(&entry("job-1", 1, "a", false)).expect("append");
        let raw = fs::read_to_string(log.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(raw.trim()).expect("json");
        assert_eq!(value["story_id"], "a");
        assert_eq!(value["success"], false);
        assert_eq!(value["job_id"], "job-1");
    }

    #[test]
    fn malformed_lines_are_counted_and_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = IterationLog::new(temp.path().join("iterations.jsonl"));
        log.append(&entry("job-1", 1, "a", false)).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        file.write_all(b"{truncated\n\n").expect("write");
        log.append(&entry("job-1", 2, "b", true)).expect("append");

        let contents = log.read().expect("read");
        assert_eq!(contents.entries.len(), 2);
        assert_eq!(contents.malformed, 1);
    }

    #[test]
    fn missing_log_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let contents = IterationLog::new(temp.path().join("none.jsonl"))
            .read()
            .expect("read");
        assert!(contents.entries.is_empty());
    }

    #[test]
    fn concurrent_appends_never_tear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = IterationLog::new(temp.path().join("iterations.jsonl"));
        std::thread::scope(|scope| {
            for job in 0..4 {
                let log = log.clone();
                scope.spawn(move || {
                    for i in 0..25 {
                        log.append(&entry(&format!("job-{job}"), i, "s", i % 2 == 0))
                            .expect("append");
                    }
                });
            }
        });
        let contents = log.read().expect("read");
        assert_eq!(contents.entries.len(), 100);
        assert_eq!(contents.malformed, 0);
    }

    #[test]
    fn prompts_are_content_addressed_and_pruned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PromptStore::new(temp.path().join("prompts"), 2);

        let first = store.persist("prompt one").expect("persist");
        let again = store.persist("prompt one").expect("persist");
        assert_eq!(first, again);
        assert_eq!(first.hash.len(), 64);
        assert_eq!(fs::read_to_string(&first.path).expect("read"), "prompt one");

        store.persist("prompt two").expect("persist");
        let last = store.persist("prompt three").expect("persist");

        let count = fs::read_dir(temp.path().join("prompts"))
            .expect("read_dir")
            .count();
        assert_eq!(count, 2);
        assert!(last.path.is_file());
    }

    #[test]
    fn progress_notes_start_with_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        let notes = ProgressNotes::new(temp.path().join("progress.md"));
        notes.note("story a committed");
        notes.note("story b skipped");
        let text = fs::read_to_string(temp.path().join("progress.md")).expect("read");
        assert!(text.starts_with(PROGRESS_HEADER));
        assert_eq!(text.lines().filter(|l| l.starts_with("- ")).count(), 2);
        assert!(text.contains("story b skipped"));
    }
}
