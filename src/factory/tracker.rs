use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::github::GitHubClient;
use super::linear::LinearClient;
use super::models::{Source, TrackerItem};
use crate::config::Secrets;

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// 1-based page number (offset-paginated trackers).
    Page(u32),
    /// Opaque continuation token; `None` means the first page.
    Cursor(Option<String>),
}

#[derive(Debug, Clone)]
pub struct TrackerPage {
    pub items: Vec<TrackerItem>,
    pub has_next: bool,
    pub next_position: PagePosition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullRequestRef {
    pub branch_ref: String,
    pub url: String,
    pub is_draft: bool,
}

/// Read-only view of an external issue tracker.
/// Real implementations: `GitHubClient`, `LinearClient`. Test double:
/// `test_support::FakeTracker`.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Fetch one page of open items for `repo_ref` (`owner/repo` or a team id).
    async fn list_open_items(
        &self,
        repo_ref: &str,
        page_size: u32,
        position: &PagePosition,
    ) -> Result<TrackerPage>;

    async fn list_open_pull_requests(&self, repo_ref: &str) -> Result<Vec<PullRequestRef>>;
}

/// One client per source. PR listing always goes through `github`, since
/// Linear teams push their branches to a GitHub remote.
#[derive(Clone)]
pub struct TrackerSet {
    pub github: Arc<dyn TrackerClient>,
    pub linear: Arc<dyn TrackerClient>,
}

impl TrackerSet {
    pub fn from_secrets(secrets: &Secrets, timeout: Duration) -> Result<Self> {
        Ok(Self {
            github: Arc::new(GitHubClient::new(secrets.github_token.clone(), timeout)?),
            linear: Arc::new(LinearClient::new(secrets.linear_token.clone(), timeout)?),
        })
    }

    pub fn for_source(&self, source: Source) -> &Arc<dyn TrackerClient> {
        match source {
            Source::Github => &self.github,
            Source::Linear => &self.linear,
        }
    }
}
