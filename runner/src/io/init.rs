//! Canonical `.runner/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RunnerConfig, write_config};
use crate::io::prd::{Prd, write_prd};

/// All canonical paths within `.runner/` for a working directory.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub runner_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub prd_path: PathBuf,
    /// Durable append-only iteration log.
    pub log_path: PathBuf,
    pub progress_path: PathBuf,
    pub prompts_dir: PathBuf,
    /// Per-iteration scratch artifacts.
    pub iterations_dir: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runner_dir = root.join(".runner");
        Self {
            root: root.clone(),
            runner_dir: runner_dir.clone(),
            gitignore_path: runner_dir.join(".gitignore"),
            config_path: runner_dir.join("config.toml"),
            prd_path: runner_dir.join("prd.json"),
            log_path: runner_dir.join("iterations.jsonl"),
            progress_path: runner_dir.join("progress.md"),
            prompts_dir: runner_dir.join("prompts"),
            iterations_dir: runner_dir.join("iterations"),
        }
    }

    /// Scratch directory for iteration `iter` of `job_id`.
    pub fn iteration_dir(&self, job_id: &str, iter: u32) -> PathBuf {
        self.iterations_dir.join(job_id).join(iter.to_string())
    }
}

/// Options for `init_runner`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing runner-owned files.
    pub force: bool,
}

/// Create `.runner/` scaffolding in `root`.
///
/// Fails if `.runner/` already exists unless `options.force` is set.
pub fn init_runner(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if paths.runner_dir.exists() && !options.force {
        return Err(anyhow!(
            "runner init: .runner already exists (use --force to overwrite)"
        ));
    }
    if paths.runner_dir.exists() && !paths.runner_dir.is_dir() {
        return Err(anyhow!(
            "runner init: .runner exists but is not a directory"
        ));
    }

    create_dir(&paths.runner_dir)?;
    create_dir(&paths.prompts_dir)?;
    create_dir(&paths.iterations_dir)?;

    write_file(&paths.gitignore_path, RUNNER_GITIGNORE)?;
    write_config(&paths.config_path, &RunnerConfig::default())?;
    write_prd(&paths.prd_path, &Prd::empty(project_name(root)))?;
    write_file(&paths.progress_path, PROGRESS_HEADER)?;

    Ok(paths)
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

pub(crate) const PROGRESS_HEADER: &str = "# Progress\n\n";
const RUNNER_GITIGNORE: &str = "iterations/\nprompts/\n";
