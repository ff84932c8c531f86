use crate::errors::AttractorError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub const DEFAULT_CHECKPOINT_EXCLUDE_GLOBS: &[&str] = &[
    ".cargo-target/**",
    "**/.cargo_target*/**",
    "**/.wasm-pack/**",
    "**/.tmpbuild/**",
];

/// Minimal git wrapper for the worktree. The engine needs exactly three
/// operations: resolving HEAD, staging everything except artifact globs,
/// and committing (allowing empty commits so every node checkpoint maps to
/// a SHA).
#[derive(Clone, Debug)]
pub struct GitWorktree {
    dir: PathBuf,
}

impl GitWorktree {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_repo(&self) -> bool {
        self.dir.join(".git").exists()
    }

    /// Initialize a fresh repository with an identity usable for automated
    /// commits. No-op when `.git` already exists.
    pub fn init_if_needed(&self) -> Result<(), AttractorError> {
        if self.is_repo() {
            return Ok(());
        }
        self.run(&["init", "--quiet"])?;
        self.run(&["config", "user.name", "attractor"])?;
        self.run(&["config", "user.email", "attractor@localhost"])?;
        Ok(())
    }

    pub fn head_sha(&self) -> Result<Option<String>, AttractorError> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.dir)
            .output()
            .map_err(|error| AttractorError::Git(format!("spawn git rev-parse: {error}")))?;
        if !output.status.success() {
            // Unborn branch: no commits yet.
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    /// `git add -A`, then unstage any path matching one of the exclusion
    /// globs so build artifacts never enter checkpoint commits.
    pub fn add_all_excluding(&self, exclude_globs: &[String]) -> Result<(), AttractorError> {
        self.run(&["add", "-A"])?;
        if exclude_globs.is_empty() {
            return Ok(());
        }

        let globs = build_globset(exclude_globs)?;
        let staged = self.run_capture(&["diff", "--cached", "--name-only"])?;
        let excluded: Vec<&str> = staged
            .lines()
            .map(str::trim)
            .filter(|path| !path.is_empty() && globs.is_match(path))
            .collect();
        if excluded.is_empty() {
            return Ok(());
        }

        debug!(count = excluded.len(), "unstaging excluded checkpoint paths");
        let mut args = vec!["reset", "--quiet", "--"];
        args.extend(excluded.iter());
        self.run(&args)?;
        Ok(())
    }

    pub fn commit_allow_empty(&self, message: &str) -> Result<String, AttractorError> {
        self.run(&["commit", "--allow-empty", "--quiet", "-m", message])?;
        self.head_sha()?
            .ok_or_else(|| AttractorError::Git("commit produced no HEAD".to_string()))
    }

    pub fn clone_local(source: &Path, dest: &Path) -> Result<Self, AttractorError> {
        let output = Command::new("git")
            .args([
                "clone",
                "--quiet",
                "--no-hardlinks",
                &source.display().to_string(),
                &dest.display().to_string(),
            ])
            .output()
            .map_err(|error| AttractorError::Git(format!("spawn git clone: {error}")))?;
        if !output.status.success() {
            return Err(AttractorError::Git(format!(
                "git clone {} -> {} failed: {}",
                source.display(),
                dest.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(Self::new(dest))
    }

    fn run(&self, args: &[&str]) -> Result<(), AttractorError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|error| AttractorError::Git(format!("spawn git {}: {error}", args.join(" "))))?;
        if !output.status.success() {
            return Err(AttractorError::Git(format!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, AttractorError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|error| AttractorError::Git(format!("spawn git {}: {error}", args.join(" "))))?;
        if !output.status.success() {
            return Err(AttractorError::Git(format!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, AttractorError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|error| {
            AttractorError::Runtime(format!("invalid checkpoint exclude glob '{pattern}': {error}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|error| AttractorError::Runtime(format!("build exclude globset: {error}")))
}
