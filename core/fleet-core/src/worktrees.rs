//! Git worktrees of the active project and whether each one is dirty.
//!
//! One `git worktree list --porcelain` plus one `git status --porcelain` per
//! worktree, each bounded by a timeout. Like review fetching this runs on a
//! refresher thread and the aggregator reads only the cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FetchCache;
use crate::command::run_with_timeout;
use crate::config::WorktreeConfig;
use crate::error::Result;
use crate::types::{WorktreeStatus, DETACHED_BRANCH};

pub trait WorktreeLister: Send + Sync {
    fn list(&self, project_path: &Path) -> Result<Vec<WorktreeStatus>>;
}

pub type WorktreeCache = FetchCache<WorktreeStatus>;

/// Lists worktrees for `project_path`; no project means no worktrees.
pub fn fetch_worktrees(
    lister: &dyn WorktreeLister,
    project_path: Option<&Path>,
) -> Result<Vec<WorktreeStatus>> {
    match project_path {
        Some(path) => lister.list(path),
        None => Ok(Vec::new()),
    }
}

pub struct GitWorktreeLister {
    command: String,
    timeout: Duration,
}

impl GitWorktreeLister {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn from_config(config: &WorktreeConfig) -> Self {
        Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    fn is_dirty(&self, worktree: &Path) -> bool {
        let path = worktree.to_string_lossy();
        let args = ["-C", &*path, "status", "--porcelain"];
        match run_with_timeout(&self.command, &args, None, self.timeout) {
            Ok(output) if output.success => !output.stdout.trim().is_empty(),
            Ok(output) => {
                tracing::debug!(
                    worktree = %worktree.display(),
                    code = output.code.unwrap_or(-1),
                    "git status failed"
                );
                false
            }
            Err(err) => {
                tracing::debug!(worktree = %worktree.display(), error = %err, "git status failed");
                false
            }
        }
    }
}

impl WorktreeLister for GitWorktreeLister {
    fn list(&self, project_path: &Path) -> Result<Vec<WorktreeStatus>> {
        if !project_path.is_dir() {
            return Ok(Vec::new());
        }
        let path = project_path.to_string_lossy();
        let args = ["-C", &*path, "worktree", "list", "--porcelain"];
        let output = run_with_timeout(&self.command, &args, None, self.timeout)?;
        if !output.success {
            // Not a repository; nothing to report.
            tracing::debug!(
                project = %project_path.display(),
                code = output.code.unwrap_or(-1),
                "git worktree list failed"
            );
            return Ok(Vec::new());
        }

        Ok(parse_worktree_list(&output.stdout)
            .into_iter()
            .map(|(path, branch)| WorktreeStatus {
                dirty: self.is_dirty(&path),
                path,
                branch,
            })
            .collect())
    }
}

#[derive(Default)]
struct Record {
    path: Option<PathBuf>,
    branch: Option<String>,
    bare: bool,
}

impl Record {
    fn finish(self, out: &mut Vec<(PathBuf, String)>) {
        if let Some(path) = self.path.filter(|_| !self.bare) {
            out.push((
                path,
                self.branch.unwrap_or_else(|| DETACHED_BRANCH.to_string()),
            ));
        }
    }
}

/// Parses `git worktree list --porcelain` into `(path, branch)` pairs,
/// skipping bare entries.
pub fn parse_worktree_list(output: &str) -> Vec<(PathBuf, String)> {
    let mut entries = Vec::new();
    let mut record = Record::default();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            std::mem::take(&mut record).finish(&mut entries);
        } else if let Some(path) = line.strip_prefix("worktree ") {
            std::mem::take(&mut record).finish(&mut entries);
            record.path = Some(PathBuf::from(path));
        } else if let Some(reference) = line.strip_prefix("branch ") {
            let name = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            record.branch = Some(name.to_string());
        } else if line == "bare" {
            record.bare = true;
        }
    }
    record.finish(&mut entries);
    entries
}
