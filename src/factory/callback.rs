//! Callback Gateway: applies an agent's terminal report exactly once.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::db::{CallbackApplication, DbHandle};
use super::models::{Callback, PrStatus, ReportedStatus};
use super::workspace::WorkspaceManager;
use crate::errors::{ScoutError, ScoutResult};

/// What the agent sent back.
#[derive(Debug, Clone, Default)]
pub struct CallbackReport {
    pub callback_id: String,
    pub status: String,
    pub pr_url: Option<String>,
    /// Free-form failure text; stored, never interpreted.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Applied,
    Cancelled,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackAck {
    pub status: &'static str,
    #[serde(skip)]
    pub outcome: AckOutcome,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_status: Option<PrStatus>,
    pub message: String,
}

impl CallbackAck {
    fn ignored(outcome: AckOutcome, message: &str) -> Self {
        Self {
            status: "ok",
            outcome,
            ignored: true,
            pr_status: None,
            message: message.to_string(),
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub struct CallbackGateway {
    db: DbHandle,
    workspaces: Arc<WorkspaceManager>,
}

impl CallbackGateway {
    pub fn new(db: DbHandle, workspaces: Arc<WorkspaceManager>) -> Self {
        Self { db, workspaces }
    }

    /// Apply `report`. Duplicate and late deliveries are acknowledged as
    /// ignored, never errors; only an unknown id or malformed input fails.
    pub async fn handle_callback(&self, report: CallbackReport) -> ScoutResult<CallbackAck> {
        let callback_id = report.callback_id.trim().to_string();
        if callback_id.is_empty() {
            return Err(ScoutError::Validation("Callback id is required".into()));
        }
        let reported = ReportedStatus::from_str(report.status.trim()).map_err(ScoutError::Validation)?;
        let pr_url = clean(report.pr_url);
        if let Some(url) = &pr_url
            && !(url.starts_with("https://") || url.starts_with("http://"))
        {
            return Err(ScoutError::Validation(format!("Invalid pr_url: {}", url)));
        }
        let error = clean(report.error);

        let id = callback_id.clone();
        let application = self
            .db
            .call(move |db| db.apply_callback(&id, reported, pr_url.as_deref(), error.as_deref()))
            .await
            .map_err(ScoutError::Database)?;

        match application {
            CallbackApplication::Unknown => Err(ScoutError::not_found("Callback", callback_id)),
            CallbackApplication::Cancelled(callback) => {
                info!(callback_id = %callback_id, "ignoring callback for cancelled run");
                self.reclaim(&callback).await;
                Ok(CallbackAck::ignored(
                    AckOutcome::Cancelled,
                    "Callback ignored because run was cancelled",
                ))
            }
            CallbackApplication::AlreadyProcessed(callback) => {
                info!(callback_id = %callback_id, status = %callback.status, "duplicate callback");
                Ok(CallbackAck::ignored(
                    AckOutcome::AlreadyProcessed,
                    "Callback already processed",
                ))
            }
            CallbackApplication::Applied {
                callback,
                pr_status,
            } => {
                if let Some(err) = &callback.error {
                    warn!(callback_id = %callback_id, error = %err, "agent reported failure");
                }
                info!(
                    callback_id = %callback_id,
                    issue_id = callback.issue_id,
                    status = %reported.as_callback_status(),
                    pr_status = %pr_status,
                    "callback applied"
                );
                self.reclaim(&callback).await;
                Ok(CallbackAck {
                    status: "ok",
                    outcome: AckOutcome::Applied,
                    ignored: false,
                    pr_status: Some(pr_status),
                    message: format!("Issue updated to {}", pr_status),
                })
            }
        }
    }

    async fn reclaim(&self, callback: &Callback) {
        let (Some(workspace), Some(root)) = (&callback.worktree_path, &callback.repo_root_path)
        else {
            return;
        };
        self.workspaces
            .destroy_workspace(&PathBuf::from(root), &PathBuf::from(workspace))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::factory::models::CallbackStatus;
    use crate::factory::test_support::Harness;
    use anyhow::Result;

    fn report(id: &str, status: &str, pr_url: Option<&str>) -> CallbackReport {
        CallbackReport {
            callback_id: id.to_string(),
            status: status.to_string(),
            pr_url: pr_url.map(str::to_string),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_complete_with_auto_pr_and_url_creates_pr() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;

        let ack = h
            .gateway
            .handle_callback(report(
                &receipt.callback_id,
                "complete",
                Some("https://github.com/acme/widgets/pull/7"),
            ))
            .await?;
        assert_eq!(ack.outcome, AckOutcome::Applied);
        assert_eq!(ack.pr_status, Some(PrStatus::PrCreated));

        let issue = h.issue(issue.id).await?;
        assert_eq!(issue.pr_status, PrStatus::PrCreated);
        assert_eq!(
            issue.pr_url.as_deref(),
            Some("https://github.com/acme/widgets/pull/7")
        );
        assert!(!receipt.workspace_path.exists());
        let callback = h.callback(&receipt.callback_id).await?;
        assert_eq!(callback.status, CallbackStatus::Complete);
        assert!(callback.completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_without_auto_pr_is_branch_pushed() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", false).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;

        h.gateway
            .handle_callback(report(&receipt.callback_id, "complete", None))
            .await?;
        assert_eq!(h.issue(issue.id).await?.pr_status, PrStatus::BranchPushed);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_noop() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;

        h.gateway
            .handle_callback(report(&receipt.callback_id, "complete", None))
            .await?;
        let after_first = h.issue(issue.id).await?;

        let ack = h
            .gateway
            .handle_callback(report(
                &receipt.callback_id,
                "failed",
                Some("https://github.com/acme/widgets/pull/9"),
            ))
            .await?;
        assert!(ack.ignored);
        assert_eq!(ack.outcome, AckOutcome::AlreadyProcessed);

        let after_second = h.issue(issue.id).await?;
        assert_eq!(after_second.pr_status, after_first.pr_status);
        assert_eq!(after_second.pr_url, after_first.pr_url);
        assert_eq!(after_second.updated_at, after_first.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_text_is_stored() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", true).await?;
        let receipt = h.launcher.launch(issue.id, None).await?;

        let mut r = report(&receipt.callback_id, "failed", None);
        r.error = Some("tests failed: 3 of 120".into());
        h.gateway.handle_callback(r).await?;

        assert_eq!(h.issue(issue.id).await?.pr_status, PrStatus::Failed);
        let callback = h.callback(&receipt.callback_id).await?;
        assert_eq!(callback.error.as_deref(), Some("tests failed: 3 of 120"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_id_and_bad_input() -> Result<()> {
        let h = Harness::new().await?;
        let err = h
            .gateway
            .handle_callback(report("nope", "complete", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = h
            .gateway
            .handle_callback(report("nope", "done", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h
            .gateway
            .handle_callback(report(" ", "complete", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h
            .gateway
            .handle_callback(report("nope", "complete", Some("javascript:alert(1)")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[test]
    fn test_ack_serialization() -> Result<()> {
        let ack = CallbackAck::ignored(AckOutcome::Cancelled, "Callback ignored because run was cancelled");
        let json = serde_json::to_value(&ack)?;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["ignored"], true);
        assert!(json.get("pr_status").is_none());
        assert!(json.get("outcome").is_none());
        Ok(())
    }
}
