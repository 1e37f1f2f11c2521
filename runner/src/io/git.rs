//! Git adapter for iteration diffs and commits.
//!
//! Diff queries feed the verifier and are best-effort: any git failure (no
//! repository, no commits yet) yields empty statistics instead of an error.
//! Commits are explicit and propagate errors.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::verifier::DiffStats;

/// Runner-owned directory, never part of an iteration's diff.
const RUNNER_PREFIX: &str = ".runner/";
const EXCLUDE_RUNNER: &str = ":(exclude).runner";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Untracked, non-ignored files outside `.runner/`.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.code == "??" && !entry.path.starts_with(RUNNER_PREFIX))
            .map(|entry| entry.path)
            .collect())
    }

    /// Working-tree diff statistics against `base` (or the index when `None`),
    /// untracked files counted as fully inserted.
    #[instrument(skip(self))]
    pub fn diff_stats(&self, base: Option<&str>) -> DiffStats {
        match self.try_diff_stats(base) {
            Ok(stats) => stats,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "diff stats unavailable");
                DiffStats::default()
            }
        }
    }

    fn try_diff_stats(&self, base: Option<&str>) -> Result<DiffStats> {
        let mut args = vec!["diff", "--numstat"];
        args.extend(base);
        args.extend(["--", ".", EXCLUDE_RUNNER]);
        let numstat = self.run_capture(&args)?;

        let mut stats = DiffStats::default();
        for line in numstat.lines() {
            let Some((insertions, deletions, path)) = parse_numstat_line(line) else {
                continue;
            };
            stats.insertions += insertions;
            stats.deletions += deletions;
            stats.files.push(path);
        }
        for path in self.untracked_files()? {
            stats.insertions += count_lines(&self.workdir.join(&path));
            if !stats.files.contains(&path) {
                stats.files.push(path);
            }
        }
        stats.files_changed = stats.files.len() as u32;
        debug!(
            files = stats.files_changed,
            insertions = stats.insertions,
            deletions = stats.deletions,
            "diff stats"
        );
        Ok(stats)
    }

    /// Unified diff against `base` plus the text of untracked files, capped at
    /// `limit_bytes`. Best-effort; empty on error.
    pub fn diff_content(&self, base: Option<&str>, limit_bytes: usize) -> String {
        let mut args = vec!["diff"];
        args.extend(base);
        args.extend(["--", ".", EXCLUDE_RUNNER]);
        let mut content = match self.run_capture(&args) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "diff content unavailable");
                return String::new();
            }
        };
        for path in self.untracked_files().unwrap_or_default() {
            if content.len() >= limit_bytes {
                break;
            }
            if let Ok(text) = fs::read_to_string(self.workdir.join(&path)) {
                content.push_str(&format!("+++ b/{path}\n"));
                for line in text.lines() {
                    content.push('+');
                    content.push_str(line);
                    content.push('\n');
                }
            }
        }
        truncate_at_char_boundary(&mut content, limit_bytes);
        content
    }

    /// Return everything outside `.runner/` to `base`: tracked paths (staged or
    /// not) are restored and untracked, non-ignored files are removed.
    #[instrument(skip(self))]
    pub fn discard_changes(&self, base: &str) -> Result<()> {
        let source = format!("--source={base}");
        self.run_checked(&[
            "restore",
            &source,
            "--staged",
            "--worktree",
            "--",
            ".",
            EXCLUDE_RUNNER,
        ])?;
        self.run_checked(&["clean", "-fdq", "--", ".", EXCLUDE_RUNNER])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit; returns the new HEAD SHA, or `None` when
    /// there was nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.add_all()?;
        if !self.commit_staged(message)? {
            return Ok(None);
        }
        self.head_sha().map(Some)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// `insertions\tdeletions\tpath`; binary files report `-` and count as zero.
fn parse_numstat_line(line: &str) -> Option<(u64, u64, String)> {
    let mut parts = line.splitn(3, '\t');
    let insertions = parts.next()?;
    let deletions = parts.next()?;
    let path = parts.next()?.trim();
    if path.is_empty() {
        return None;
    }
    Some((
        insertions.parse().unwrap_or(0),
        deletions.parse().unwrap_or(0),
        path.to_string(),
    ))
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

fn count_lines(path: &Path) -> u64 {
    fs::read(path)
        .map(|bytes| {
            let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
            if bytes.last().is_some_and(|b| *b != b'\n') {
                newlines + 1
            } else {
                newlines
            }
        })
        .unwrap_or(0)
}

fn truncate_at_char_boundary(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_numstat_lines() {
        assert_eq!(
            parse_numstat_line("3\t1\tsrc/lib.rs"),
            Some((3, 1, "src/lib.rs".to_string()))
        );
        assert_eq!(
            parse_numstat_line("-\t-\tlogo.png"),
            Some((0, 0, "logo.png".to_string()))
        );
        assert_eq!(parse_numstat_line("garbage"), None);
    }

    #[test]
    fn diff_outside_repository_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        assert!(git.head_sha().is_err());
        assert_eq!(git.diff_stats(Some("HEAD")), DiffStats::default());
        assert_eq!(git.diff_content(Some("HEAD"), 1024), "");
    }

    #[test]
    fn diff_counts_tracked_and_untracked_changes() {
        let repo = TestRepo::new();
        repo.write("src/app.ts", "one\ntwo\n");
        repo.commit("initial");
        let git = Git::new(repo.path());
        let base = git.head_sha().expect("head");

        repo.write("src/app.ts", "one\nthree\nfour\n");
        repo.write("src/app.test.ts", "a\nb\nc\n");
        repo.write(".runner/progress.md", "ignored\n");

        let stats = git.diff_stats(Some(&base));
        assert_eq!(stats.files_changed, 2);
        assert_eq!(stats.insertions, 2 + 3);
        assert_eq!(stats.deletions, 1);
        assert!(stats.files.contains(&"src/app.test.ts".to_string()));
        assert!(!stats.files.iter().any(|f| f.starts_with(".runner")));

        let content = git.diff_content(Some(&base), 10_000);
        assert!(content.contains("+three"));
        assert!(content.contains("+++ b/src/app.test.ts"));
        assert!(!content.contains("ignored"));
    }

    #[test]
    fn discard_changes_restores_tree_but_keeps_runner_files() {
        let repo = TestRepo::new();
        repo.write("src/app.ts", "one\n");
        repo.write(".runner/progress.md", "# Progress\n");
        repo.commit("initial");
        let git = Git::new(repo.path());
        let base = git.head_sha().expect("head");

        repo.write("src/app.ts", "rewritten\n");
        repo.write("src/staged.ts", "staged\n");
        git.add_all().expect("stage");
        repo.write("src/scratch/notes.ts", "untracked\n");
        repo.write(".runner/progress.md", "# Progress\n\n- attempt 1\n");
        repo.write(".runner/iterations.jsonl", "{}\n");

        git.discard_changes(&base).expect("discard");

        assert_eq!(
            fs::read_to_string(repo.path().join("src/app.ts")).expect("read"),
            "one\n"
        );
        assert!(!repo.path().join("src/staged.ts").exists());
        assert!(!repo.path().join("src/scratch").exists());
        assert!(!git.has_staged_changes().expect("staged"));
        assert!(
            fs::read_to_string(repo.path().join(".runner/progress.md"))
                .expect("read")
                .contains("attempt 1")
        );
        assert!(repo.path().join(".runner/iterations.jsonl").is_file());
    }

    #[test]
    fn commit_all_returns_new_head() {
        let repo = TestRepo::new();
        repo.write("README.md", "hello\n");
        repo.commit("initial");
        let git = Git::new(repo.path());
        let before = git.head_sha().expect("head");

        assert_eq!(git.commit_all("nothing").expect("commit"), None);

        repo.write("src/main.rs", "fn main() {}\n");
        let sha = git.commit_all("add main").expect("commit").expect("sha");
        assert_ne!(sha, before);
        assert_eq!(git.head_sha().expect("head"), sha);
        assert!(git.untracked_files().expect("untracked").is_empty());
    }
}
