//! Sync Engine: one tracker page per call, resumable from a stored cursor,
//! plus a separate pass that matches run branches against open PRs.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::db::DbHandle;
use super::github::detect_github_repo_from_path;
use super::models::{PrStatus, Repo, RepoSyncState, Source};
use super::tracker::{PagePosition, TrackerSet};
use crate::errors::{ScoutError, ScoutResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncPageResult {
    pub repo_id: i64,
    pub new: usize,
    pub updated: usize,
    pub fetched_count: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrCheckResult {
    pub repo_id: i64,
    pub checked: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoError {
    pub repo_id: i64,
    pub error: String,
}

/// Per-repo results of a pass over every repo. One repo failing does not
/// stop the others.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    pub results: Vec<T>,
    pub errors: Vec<RepoError>,
}

pub struct SyncEngine {
    db: DbHandle,
    trackers: TrackerSet,
    page_size: u32,
    remote: String,
}

impl SyncEngine {
    pub fn new(db: DbHandle, trackers: TrackerSet, page_size: u32, remote: impl Into<String>) -> Self {
        Self {
            db,
            trackers,
            page_size: page_size.clamp(1, 100),
            remote: remote.into(),
        }
    }

    async fn load_repo(&self, repo_id: i64) -> ScoutResult<Repo> {
        self.db
            .call(move |db| db.get_repo(repo_id))
            .await
            .map_err(ScoutError::Database)?
            .ok_or_else(|| ScoutError::not_found("Repo", repo_id))
    }

    /// Fetch and store the next page for a repo.
    ///
    /// An exhausted cursor returns a zero result without contacting the
    /// tracker until `reset` is called. On any failure the cursor is left
    /// where it was, so the same page is fetched next time.
    pub async fn sync_page(&self, repo_id: i64) -> ScoutResult<SyncPageResult> {
        let repo = self.load_repo(repo_id).await?;
        let page_size = self.page_size;
        let state = self
            .db
            .call(move |db| db.get_or_create_sync_state(repo_id, page_size))
            .await
            .map_err(ScoutError::Database)?;

        if !state.has_more {
            debug!(repo_id, "sync cursor exhausted, skipping fetch");
            return Ok(SyncPageResult {
                repo_id,
                new: 0,
                updated: 0,
                fetched_count: 0,
                has_more: false,
            });
        }

        let position = match repo.source {
            Source::Github => PagePosition::Page(state.next_page.max(1)),
            Source::Linear => PagePosition::Cursor(state.next_cursor.clone()),
        };
        let page = self
            .trackers
            .for_source(repo.source)
            .list_open_items(&repo.source_id, state.page_size, &position)
            .await
            .map_err(ScoutError::upstream)?;

        let fetched_count = page.items.len();
        let mut next = RepoSyncState {
            has_more: page.has_next,
            last_fetch_count: fetched_count as u32,
            last_fetch_at: Some(chrono::Utc::now().to_rfc3339()),
            ..state.clone()
        };
        match page.next_position {
            PagePosition::Page(n) => next.next_page = n,
            PagePosition::Cursor(c) => next.next_cursor = c,
        }

        let source = repo.source;
        let items = page.items;
        let stored = self
            .db
            .call(move |db| db.store_issue_page(repo_id, source, &items, &state, &next))
            .await
            .map_err(ScoutError::Database)?;
        if !stored.cursor_advanced {
            warn!(repo_id, "sync cursor moved by a concurrent sync, keeping it");
        }
        let counts = stored.counts;
        let has_more = stored.cursor.has_more;

        info!(
            repo_id,
            fetched = fetched_count,
            new = counts.new,
            updated = counts.updated,
            has_more,
            "synced issue page"
        );
        Ok(SyncPageResult {
            repo_id,
            new: counts.new,
            updated: counts.updated,
            fetched_count,
            has_more,
        })
    }

    /// Rewind a repo's cursor to the first page.
    pub async fn reset(&self, repo_id: i64) -> ScoutResult<RepoSyncState> {
        self.load_repo(repo_id).await?;
        let page_size = self.page_size;
        let state = self
            .db
            .call(move |db| db.reset_sync_state(repo_id, page_size))
            .await
            .map_err(ScoutError::Database)?;
        info!(repo_id, "sync cursor reset");
        Ok(state)
    }

    pub async fn sync_all(&self) -> ScoutResult<BatchReport<SyncPageResult>> {
        let repos = self.list_repo_ids().await?;
        let mut report = BatchReport {
            results: Vec::new(),
            errors: Vec::new(),
        };
        for repo_id in repos {
            match self.sync_page(repo_id).await {
                Ok(r) => report.results.push(r),
                Err(e) => {
                    warn!(repo_id, error = %e, "sync failed");
                    report.errors.push(RepoError {
                        repo_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Match branches of runs still awaiting a PR against the remote's
    /// open pull requests. Unmatched issues are left for the next pass.
    pub async fn detect_prs(&self, repo_id: i64) -> ScoutResult<PrCheckResult> {
        let repo = self.load_repo(repo_id).await?;
        let awaiting = self
            .db
            .call(move |db| db.issues_awaiting_pr(repo_id))
            .await
            .map_err(ScoutError::Database)?;
        if awaiting.is_empty() {
            return Ok(PrCheckResult {
                repo_id,
                checked: 0,
                updated: 0,
            });
        }

        let owner_repo = self.pull_request_repo(&repo).await?;
        let pulls = self
            .trackers
            .github
            .list_open_pull_requests(&owner_repo)
            .await
            .map_err(ScoutError::upstream)?;

        let matches: Vec<(i64, String, PrStatus)> = awaiting
            .iter()
            .filter_map(|issue| {
                let branch = issue.pr_branch.as_deref()?;
                let pr = pulls.iter().find(|p| p.branch_ref == branch)?;
                let status = if pr.is_draft {
                    PrStatus::NeedsReview
                } else {
                    PrStatus::PrCreated
                };
                Some((issue.id, pr.url.clone(), status))
            })
            .collect();

        let updated = self
            .db
            .call(move |db| {
                let mut updated = 0;
                for (issue_id, url, status) in &matches {
                    if db.record_detected_pr(*issue_id, url, *status)? {
                        updated += 1;
                    }
                }
                Ok(updated)
            })
            .await
            .map_err(ScoutError::Database)?;

        if updated > 0 {
            info!(repo_id, updated, "detected pull requests");
        }
        Ok(PrCheckResult {
            repo_id,
            checked: awaiting.len(),
            updated,
        })
    }

    pub async fn detect_prs_all(&self) -> ScoutResult<BatchReport<PrCheckResult>> {
        let repos = self.list_repo_ids().await?;
        let mut report = BatchReport {
            results: Vec::new(),
            errors: Vec::new(),
        };
        for repo_id in repos {
            match self.detect_prs(repo_id).await {
                Ok(r) => report.results.push(r),
                Err(e) => {
                    warn!(repo_id, error = %e, "PR detection failed");
                    report.errors.push(RepoError {
                        repo_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn list_repo_ids(&self) -> ScoutResult<Vec<i64>> {
        let repos = self
            .db
            .call(|db| db.list_repos())
            .await
            .map_err(ScoutError::Database)?;
        Ok(repos.into_iter().map(|r| r.id).collect())
    }

    /// GitHub repos are their own PR source; Linear teams use the GitHub
    /// remote of their local checkout.
    async fn pull_request_repo(&self, repo: &Repo) -> ScoutResult<String> {
        match repo.source {
            Source::Github => Ok(repo.source_id.clone()),
            Source::Linear => {
                let path = repo.local_path.as_deref().unwrap_or_default();
                let detected = if path.is_empty() {
                    None
                } else {
                    detect_github_repo_from_path(Path::new(path), &self.remote).await
                };
                detected.ok_or_else(|| {
                    ScoutError::Validation(format!(
                        "Cannot determine the GitHub repository for {}: no GitHub {} remote in its local checkout",
                        repo.name, self.remote
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::factory::models::Assessment;
    use crate::factory::test_support::{Harness, tracker_item};
    use crate::factory::tracker::PullRequestRef;
    use anyhow::Result;

    fn items(n: usize) -> Vec<crate::factory::models::TrackerItem> {
        (1..=n)
            .map(|i| tracker_item(&i.to_string(), &format!("Issue {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_paged_sync_traverses_once_then_stops() -> Result<()> {
        let h = Harness::new().await?;
        let repo = h.add_repo(Source::Github, "acme/widgets", false).await?;
        h.github.set_items("acme/widgets", items(7));

        let mut seen = HashSet::new();
        let mut total_new = 0;
        for expected in [3, 3, 1] {
            let r = h.sync.sync_page(repo.id).await?;
            assert_eq!(r.fetched_count, expected);
            total_new += r.new;
        }
        assert_eq!(total_new, 7);
        for issue in h.all_issues(repo.id).await? {
            assert!(seen.insert(issue.source_id));
        }
        assert_eq!(seen.len(), 7);

        let fetches_before = h.github.fetches().len();
        let r = h.sync.sync_page(repo.id).await?;
        assert_eq!(r.fetched_count, 0);
        assert!(!r.has_more);
        assert_eq!(h.github.fetches().len(), fetches_before, "no tracker call once exhausted");
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_sync_for_linear() -> Result<()> {
        let h = Harness::new().await?;
        let repo = h.add_repo(Source::Linear, "team-1", false).await?;
        h.linear.set_items("team-1", items(5));

        assert!(h.sync.sync_page(repo.id).await?.has_more);
        let last = h.sync.sync_page(repo.id).await?;
        assert_eq!(last.fetched_count, 2);
        assert!(!last.has_more);

        let positions: Vec<PagePosition> = h.linear.fetches().into_iter().map(|f| f.2).collect();
        assert_eq!(
            positions,
            vec![PagePosition::Cursor(None), PagePosition::Cursor(Some("3".into()))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cursor() -> Result<()> {
        let h = Harness::new().await?;
        let repo = h.add_repo(Source::Github, "acme/widgets", false).await?;
        h.github.set_items("acme/widgets", items(7));
        h.sync.sync_page(repo.id).await?;

        h.github.fail_next_fetch("502 Bad Gateway");
        let err = h.sync.sync_page(repo.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);

        h.sync.sync_page(repo.id).await?;
        let pages: Vec<PagePosition> = h.github.fetches().into_iter().map(|f| f.2).collect();
        assert_eq!(
            pages,
            vec![PagePosition::Page(1), PagePosition::Page(2), PagePosition::Page(2)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_resync_preserves_local_fields() -> Result<()> {
        let h = Harness::new().await?;
        let (repo, issue) = h.seed_issue("42", "Crash", true).await?;
        h.record_assessment(issue.id, Assessment::AgenticPrCapable).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;
        let before = h.issue(issue.id).await?;

        let mut changed = tracker_item("42", "Crash on login (iOS)");
        changed.labels = vec!["bug".into(), "ios".into()];
        changed.status = "closed".into();
        h.github.set_items(&repo.source_id, vec![changed]);
        h.sync.reset(repo.id).await?;
        let r = h.sync.sync_page(repo.id).await?;
        assert_eq!((r.new, r.updated), (0, 1));

        let after = h.issue(issue.id).await?;
        assert_eq!(after.title, "Crash on login (iOS)");
        assert_eq!(after.labels, vec!["bug", "ios"]);
        assert_eq!(after.status, "closed");
        assert_eq!(after.assessment, Assessment::AgenticPrCapable);
        assert_eq!(after.pr_status, before.pr_status);
        assert_eq!(after.pr_branch.as_deref(), Some(receipt.branch_name.as_str()));
        assert_eq!(after.pr_url, before.pr_url);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_unknown_repo_is_not_found() -> Result<()> {
        let h = Harness::new().await?;
        assert_eq!(h.sync.reset(77).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.sync.sync_page(77).await.unwrap_err().kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_detect_prs_matches_branch_and_draft_state() -> Result<()> {
        let h = Harness::new().await?;
        let (repo, issue) = h.seed_issue("42", "Crash", false).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;
        h.github.set_pull_requests(
            &repo.source_id,
            vec![
                PullRequestRef {
                    branch_ref: "someone-else/feature".into(),
                    url: "https://github.com/acme/widgets/pull/1".into(),
                    is_draft: false,
                },
                PullRequestRef {
                    branch_ref: receipt.branch_name.clone(),
                    url: "https://github.com/acme/widgets/pull/2".into(),
                    is_draft: true,
                },
            ],
        );

        let r = h.sync.detect_prs(repo.id).await?;
        assert_eq!((r.checked, r.updated), (1, 1));
        let issue = h.issue(issue.id).await?;
        assert_eq!(issue.pr_status, PrStatus::NeedsReview);
        assert_eq!(
            issue.pr_url.as_deref(),
            Some("https://github.com/acme/widgets/pull/2")
        );

        // needs_review is no longer awaiting a PR.
        assert_eq!(h.sync.detect_prs(repo.id).await?.checked, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_detect_prs_leaves_unmatched_issue_alone() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", false).await?;
        h.launcher.launch(issue.id, None).await?;

        let r = h.sync.detect_prs(issue.repo_id).await?;
        assert_eq!((r.checked, r.updated), (1, 0));
        assert_eq!(h.issue(issue.id).await?.pr_status, PrStatus::InProgress);
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_all_collects_per_repo_errors() -> Result<()> {
        let h = Harness::new().await?;
        let failing = h.add_repo(Source::Github, "acme/widgets", false).await?;
        let healthy = h.add_repo(Source::Github, "acme/gadgets", false).await?;
        h.github.set_items("acme/widgets", items(2));
        h.github.set_items("acme/gadgets", items(1));
        // Repos are synced in id order, so the queued failure hits the first.
        h.github.fail_next_fetch("502 Bad Gateway");

        let report = h.sync.sync_all().await?;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].repo_id, failing.id);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].repo_id, healthy.id);
        assert_eq!(report.results[0].new, 1);
        Ok(())
    }
}
