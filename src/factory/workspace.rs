//! Per-run isolated checkouts (git worktrees).
//!
//! Every workspace lives at `<root>/<repo_id>/<run_id>`, where `<root>` is
//! this service's scratch root. Destructive operations (force-remove,
//! `remove_dir_all`) are only ever applied to paths below that root.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{ScoutError, ScoutResult};

/// Narrow interface over the version control tool. Arguments are passed as
/// discrete values, never through a shell.
/// Real implementation: `GitCli`. Test double: `test_support::FakeVcs`.
#[async_trait]
pub trait VcsTool: Send + Sync {
    async fn fetch(&self, repo_root: &Path, remote: &str, reference: &str) -> Result<()>;

    async fn add_worktree(
        &self,
        repo_root: &Path,
        new_branch: &str,
        path: &Path,
        base_ref: &str,
    ) -> Result<()>;

    async fn remove_worktree(&self, repo_root: &Path, path: &Path, force: bool) -> Result<()>;

    async fn prune_worktrees(&self, repo_root: &Path) -> Result<()>;
}

/// `VcsTool` backed by the `git` binary.
pub struct GitCli {
    fetch_timeout: Duration,
}

impl GitCli {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self { fetch_timeout }
    }

    async fn git(&self, repo_root: &Path, args: &[&OsStr]) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .context("Failed to run git")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "git {} failed: {}",
                args.first().map(|a| a.to_string_lossy()).unwrap_or_default(),
                stderr.trim()
            );
        }
        Ok(())
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl VcsTool for GitCli {
    async fn fetch(&self, repo_root: &Path, remote: &str, reference: &str) -> Result<()> {
        let args = [
            OsStr::new("fetch"),
            OsStr::new("--end-of-options"),
            OsStr::new(remote),
            OsStr::new(reference),
        ];
        tokio::time::timeout(self.fetch_timeout, self.git(repo_root, &args))
            .await
            .with_context(|| {
                format!("git fetch timed out after {}s", self.fetch_timeout.as_secs())
            })?
    }

    async fn add_worktree(
        &self,
        repo_root: &Path,
        new_branch: &str,
        path: &Path,
        base_ref: &str,
    ) -> Result<()> {
        // -B so a branch left behind by a reclaimed run is reset to the base.
        // A branch still checked out elsewhere is refused with its path.
        let args = [
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("-B"),
            OsStr::new(new_branch),
            OsStr::new("--end-of-options"),
            path.as_os_str(),
            OsStr::new(base_ref),
        ];
        self.git(repo_root, &args).await
    }

    async fn remove_worktree(&self, repo_root: &Path, path: &Path, force: bool) -> Result<()> {
        let mut args = vec![OsStr::new("worktree"), OsStr::new("remove")];
        if force {
            args.push(OsStr::new("--force"));
        }
        args.push(OsStr::new("--end-of-options"));
        args.push(path.as_os_str());
        self.git(repo_root, &args).await
    }

    async fn prune_worktrees(&self, repo_root: &Path) -> Result<()> {
        self.git(repo_root, &[OsStr::new("worktree"), OsStr::new("prune")])
            .await
    }
}

static CONFLICT_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:already checked out at|already used by worktree at) '([^']+)'")
        .expect("valid conflict regex")
});

/// Check a branch name the way `git check-ref-format --branch` would, and
/// refuse anything git could read as an option.
pub fn check_branch_name(name: &str) -> ScoutResult<()> {
    let invalid = |reason: &str| {
        Err(ScoutError::Validation(format!(
            "Invalid branch name {:?}: {}",
            name, reason
        )))
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('-') {
        return invalid("starts with '-'");
    }
    if name == "@" {
        return invalid("'@' is reserved");
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(*c))
    {
        return invalid(&format!("contains {:?}", c));
    }
    if name.contains("..") || name.contains("@{") {
        return invalid("contains '..' or '@{'");
    }
    if name.starts_with('/') || name.ends_with('/') || name.ends_with('.') {
        return invalid("starts or ends with '/' or ends with '.'");
    }
    if name
        .split('/')
        .any(|part| part.is_empty() || part.starts_with('.') || part.ends_with(".lock"))
    {
        return invalid("has an empty, dot-prefixed or .lock component");
    }
    Ok(())
}

/// Extract the checkout path from git's "branch already in use" error text.
pub fn parse_conflicting_worktree(error_text: &str) -> Option<PathBuf> {
    CONFLICT_PATH_RE
        .captures(error_text)
        .map(|caps| PathBuf::from(&caps[1]))
}

pub struct WorkspaceManager {
    vcs: Arc<dyn VcsTool>,
    root: PathBuf,
    remote: String,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VcsTool>, root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            vcs,
            root: root.into(),
            remote: remote.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_path(&self, repo_id: i64, run_id: &str) -> PathBuf {
        self.root.join(repo_id.to_string()).join(run_id)
    }

    /// True when `path` is strictly below the scratch root and contains no
    /// `..` or `.` components.
    pub fn owns(&self, path: &Path) -> bool {
        if !path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return false;
        }
        let below = |root: &Path| path.starts_with(root) && path != root;
        if below(&self.root) {
            return true;
        }
        // git reports canonical paths (e.g. /private/tmp on macOS).
        match std::fs::canonicalize(&self.root) {
            Ok(canonical) => below(&canonical),
            Err(_) => false,
        }
    }

    /// Fetch `base_ref`, then create branch `branch` in a fresh checkout at
    /// `<root>/<repo_id>/<run_id>`.
    ///
    /// If the branch is already claimed by a stale checkout below the
    /// scratch root, that checkout is removed and creation is retried once.
    /// A claim from anywhere else fails the run without touching it.
    pub async fn create_workspace(
        &self,
        repo_root: &Path,
        repo_id: i64,
        run_id: &str,
        branch: &str,
        base_ref: &str,
    ) -> ScoutResult<PathBuf> {
        if run_id.is_empty()
            || !run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ScoutError::Validation(format!("Invalid run id: {:?}", run_id)));
        }
        check_branch_name(branch)?;
        check_branch_name(base_ref)?;

        self.vcs
            .fetch(repo_root, &self.remote, base_ref)
            .await
            .map_err(|e| {
                ScoutError::Upstream(format!(
                    "Failed to fetch {} from {}: {:#}",
                    base_ref, self.remote, e
                ))
            })?;

        let path = self.workspace_path(repo_id, run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(ScoutError::resource)?;
        }

        let start_point = format!("{}/{}", self.remote, base_ref);
        let err = match self
            .vcs
            .add_worktree(repo_root, branch, &path, &start_point)
            .await
        {
            Ok(()) => {
                info!(path = %path.display(), branch, "created workspace");
                return Ok(path);
            }
            Err(e) => e,
        };

        let message = format!("{:#}", err);
        let Some(conflict) = parse_conflicting_worktree(&message) else {
            return Err(ScoutError::Resource(format!(
                "Failed to create worktree for {}: {}",
                branch, message
            )));
        };
        if !self.owns(&conflict) {
            return Err(ScoutError::Conflict(format!(
                "Branch {} is checked out at {}, outside {}; leaving it alone",
                branch,
                conflict.display(),
                self.root.display()
            )));
        }

        warn!(
            branch,
            stale = %conflict.display(),
            "branch claimed by stale workspace, reclaiming and retrying"
        );
        self.force_remove(repo_root, &conflict).await;

        self.vcs
            .add_worktree(repo_root, branch, &path, &start_point)
            .await
            .map_err(|e| {
                ScoutError::Resource(format!(
                    "Failed to create worktree for {} after recovery: {:#}",
                    branch, e
                ))
            })?;
        info!(path = %path.display(), branch, "created workspace after recovery");
        Ok(path)
    }

    /// Remove a workspace. Missing paths are a no-op and every failure is
    /// logged and swallowed.
    pub async fn destroy_workspace(&self, repo_root: &Path, path: &Path) {
        if !path.exists() {
            debug!(path = %path.display(), "workspace already gone");
            return;
        }
        if !self.owns(path) {
            warn!(path = %path.display(), "refusing to remove workspace outside scratch root");
            return;
        }
        self.force_remove(repo_root, path).await;
        info!(path = %path.display(), "removed workspace");
    }

    async fn force_remove(&self, repo_root: &Path, path: &Path) {
        if let Err(e) = self.vcs.remove_worktree(repo_root, path, true).await {
            warn!(path = %path.display(), error = %format!("{:#}", e), "git worktree remove failed");
        }
        if path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            warn!(path = %path.display(), error = %e, "failed to delete workspace directory");
        }
        if let Err(e) = self.vcs.prune_worktrees(repo_root).await {
            warn!(error = %format!("{:#}", e), "git worktree prune failed");
        }
    }
}
