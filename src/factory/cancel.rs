//! Cancellation Controller.
//!
//! The database is updated first: pending callbacks become `cancelled` and
//! the issue returns to `none` in one transaction. Only then are processes
//! signalled and workspaces reclaimed. A run that finishes while it is
//! being killed will find its callback already `cancelled` and be ignored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::db::DbHandle;
use super::models::Callback;
use super::process::{ProcessSupervisor, SignalKind};
use super::workspace::WorkspaceManager;
use crate::errors::{ScoutError, ScoutResult};

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub issue_id: i64,
    /// Processes found tagged with a cancelled run's id.
    pub terminated_process_count: usize,
    pub cancelled_callbacks: Vec<String>,
}

pub struct CancellationController {
    db: DbHandle,
    workspaces: Arc<WorkspaceManager>,
    supervisor: Arc<dyn ProcessSupervisor>,
    grace: Duration,
}

impl CancellationController {
    pub fn new(
        db: DbHandle,
        workspaces: Arc<WorkspaceManager>,
        supervisor: Arc<dyn ProcessSupervisor>,
        grace: Duration,
    ) -> Self {
        Self {
            db,
            workspaces,
            supervisor,
            grace,
        }
    }

    pub async fn cancel(&self, issue_id: i64) -> ScoutResult<CancelOutcome> {
        let pending = self
            .db
            .call(move |db| db.cancel_pending_for_issue(issue_id))
            .await
            .map_err(ScoutError::Database)?
            .ok_or_else(|| ScoutError::not_found("Issue", issue_id))?;

        let counts = join_all(pending.iter().map(|cb| self.stop_run(cb))).await;
        let outcome = CancelOutcome {
            issue_id,
            terminated_process_count: counts.iter().sum(),
            cancelled_callbacks: pending.into_iter().map(|cb| cb.callback_id).collect(),
        };
        info!(
            issue_id,
            runs = outcome.cancelled_callbacks.len(),
            processes = outcome.terminated_process_count,
            "cancelled issue runs"
        );
        Ok(outcome)
    }

    /// TERM, wait out the grace period, KILL whatever is left, then reclaim
    /// the workspace whatever happened. Returns how many processes were found.
    async fn stop_run(&self, callback: &Callback) -> usize {
        let tag = callback.callback_id.as_str();
        let pids = match self.supervisor.list_tagged(tag).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(callback_id = tag, error = %format!("{:#}", e), "failed to list run processes");
                Vec::new()
            }
        };

        if !pids.is_empty() {
            for &pid in &pids {
                self.send(pid, SignalKind::Terminate, tag).await;
            }
            tokio::time::sleep(self.grace).await;

            let survivors = match self.supervisor.list_tagged(tag).await {
                Ok(live) => live,
                Err(e) => {
                    warn!(callback_id = tag, error = %format!("{:#}", e), "failed to re-list run processes");
                    pids.clone()
                }
            };
            for pid in survivors {
                debug!(callback_id = tag, pid, "process survived SIGTERM");
                self.send(pid, SignalKind::Kill, tag).await;
            }
        }

        if let (Some(workspace), Some(root)) = (&callback.worktree_path, &callback.repo_root_path) {
            self.workspaces
                .destroy_workspace(&PathBuf::from(root), &PathBuf::from(workspace))
                .await;
        }
        pids.len()
    }

    async fn send(&self, pid: u32, kind: SignalKind, tag: &str) {
        if let Err(e) = self.supervisor.signal(pid, kind).await {
            warn!(callback_id = tag, pid, ?kind, error = %format!("{:#}", e), "signal delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::factory::callback::{AckOutcome, CallbackReport};
    use crate::factory::models::{CallbackStatus, PrStatus};
    use crate::factory::test_support::Harness;
    use anyhow::Result;

    #[tokio::test]
    async fn test_cancel_pending_run_resets_issue_and_kills_process() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;

        let outcome = h.canceller.cancel(issue.id).await?;
        assert_eq!(outcome.terminated_process_count, 1);
        assert_eq!(outcome.cancelled_callbacks, vec![receipt.callback_id.clone()]);
        assert_eq!(
            h.supervisor.signals(),
            vec![(receipt.pid, SignalKind::Terminate)]
        );
        assert!(h.supervisor.live_tagged(&receipt.callback_id).is_empty());
        assert!(!receipt.workspace_path.exists());

        let issue = h.issue(issue.id).await?;
        assert_eq!(issue.pr_status, PrStatus::None);
        assert!(issue.pr_url.is_none());
        assert!(issue.pr_branch.is_none());
        let callback = h.callback(&receipt.callback_id).await?;
        assert_eq!(callback.status, CallbackStatus::Cancelled);
        assert!(callback.completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_survivors_are_force_killed() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;
        h.supervisor.add_tagged(&receipt.callback_id, 7777);
        h.supervisor.ignore_terminate(7777);

        let outcome = h.canceller.cancel(issue.id).await?;
        assert_eq!(outcome.terminated_process_count, 2);
        let signals = h.supervisor.signals();
        assert!(signals.contains(&(7777, SignalKind::Terminate)));
        assert!(signals.contains(&(7777, SignalKind::Kill)));
        assert!(!signals.contains(&(receipt.pid, SignalKind::Kill)));
        assert!(h.supervisor.live_tagged(&receipt.callback_id).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_late_callback_after_cancel_is_ignored() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;
        h.canceller.cancel(issue.id).await?;

        for status in ["complete", "failed", "needs_review"] {
            let ack = h
                .gateway
                .handle_callback(CallbackReport {
                    callback_id: receipt.callback_id.clone(),
                    status: status.into(),
                    pr_url: Some("https://github.com/acme/widgets/pull/7".into()),
                    error: None,
                })
                .await?;
            assert_eq!(ack.outcome, AckOutcome::Cancelled);
        }
        let issue = h.issue(issue.id).await?;
        assert_eq!(issue.pr_status, PrStatus::None);
        assert!(issue.pr_url.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_without_pending_run_is_a_noop() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let outcome = h.canceller.cancel(issue.id).await?;
        assert_eq!(outcome.terminated_process_count, 0);
        assert!(outcome.cancelled_callbacks.is_empty());
        assert!(h.supervisor.signals().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_unknown_issue_is_not_found() -> Result<()> {
        let h = Harness::new().await?;
        let err = h.canceller.cancel(404).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_relaunch_after_cancel() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let first = h.launcher.launch(issue.id, None).await?;
        h.canceller.cancel(issue.id).await?;
        let second = h.launcher.launch(issue.id, None).await?;
        assert_ne!(first.callback_id, second.callback_id);
        assert_ne!(first.branch_name, second.branch_name);
        assert_eq!(h.issue(issue.id).await?.pr_status, PrStatus::InProgress);
        Ok(())
    }
}
