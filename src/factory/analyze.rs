//! Issue assessment: asks a model whether an issue is a good fit for an
//! autonomous run and stores the verdict on the issue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::ai::{ModelClient, ModelResolver, SETTING_ASSESSMENT_MODEL, request_assessment};
use super::db::DbHandle;
use super::models::Issue;
use super::prompts::{PromptSet, TemplateContext};
use crate::errors::{ScoutError, ScoutResult};

/// Issues assessed per batch call.
pub const BATCH_LIMIT: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct IssueError {
    pub issue_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchAnalysis {
    pub analyzed: usize,
    /// Issues still `pending` after this batch.
    pub remaining: u64,
    pub results: Vec<Issue>,
    pub errors: Vec<IssueError>,
}

pub struct Analyzer {
    db: DbHandle,
    client: Arc<dyn ModelClient>,
    prompts: Arc<PromptSet>,
    resolver: ModelResolver,
}

impl Analyzer {
    pub fn new(
        db: DbHandle,
        client: Arc<dyn ModelClient>,
        prompts: Arc<PromptSet>,
        resolver: ModelResolver,
    ) -> Self {
        Self {
            db,
            client,
            prompts,
            resolver,
        }
    }

    async fn resolve_model(&self, explicit: Option<&str>) -> ScoutResult<String> {
        let setting = self
            .db
            .call(|db| db.get_setting(SETTING_ASSESSMENT_MODEL))
            .await
            .map_err(ScoutError::Database)?;
        Ok(self.resolver.assessment_model(explicit, setting.as_deref()))
    }

    fn render_prompt(&self, issue: &Issue) -> String {
        let ctx = TemplateContext::new()
            .value("issue_title", &issue.title)
            .value("issue_description", &issue.description)
            .value("issue_labels", issue.labels.join(", "))
            .value("issue_url", &issue.source_url)
            .value("source_id", &issue.source_id)
            .value("priority", &issue.priority);
        self.prompts.assessment().render(&ctx)
    }

    pub async fn analyze_issue(&self, issue_id: i64, model: Option<&str>) -> ScoutResult<Issue> {
        let model = self.resolve_model(model).await?;
        self.analyze_with(issue_id, &model).await
    }

    async fn analyze_with(&self, issue_id: i64, model: &str) -> ScoutResult<Issue> {
        let issue = self
            .db
            .call(move |db| db.get_issue(issue_id))
            .await
            .map_err(ScoutError::Database)?
            .ok_or_else(|| ScoutError::not_found("Issue", issue_id))?;

        let prompt = self.render_prompt(&issue);
        let reply = request_assessment(self.client.as_ref(), model, &prompt)
            .await
            .map_err(ScoutError::upstream)?;

        let model_name = model.to_string();
        let updated = self
            .db
            .call(move |db| {
                db.record_assessment(issue_id, reply.assessment, &reply.summary, &model_name)
            })
            .await
            .map_err(ScoutError::Database)?
            .ok_or_else(|| ScoutError::not_found("Issue", issue_id))?;

        info!(issue_id, model, assessment = %updated.assessment, "issue assessed");
        Ok(updated)
    }

    /// Assess up to [`BATCH_LIMIT`] pending issues of a repo. A failure on
    /// one issue is reported next to the successes.
    pub async fn analyze_batch(&self, repo_id: i64, model: Option<&str>) -> ScoutResult<BatchAnalysis> {
        self.db
            .call(move |db| db.get_repo(repo_id))
            .await
            .map_err(ScoutError::Database)?
            .ok_or_else(|| ScoutError::not_found("Repo", repo_id))?;

        let model = self.resolve_model(model).await?;
        let pending = self
            .db
            .call(move |db| db.pending_assessment(repo_id, BATCH_LIMIT))
            .await
            .map_err(ScoutError::Database)?;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for issue in pending {
            match self.analyze_with(issue.id, &model).await {
                Ok(updated) => results.push(updated),
                Err(e) => {
                    warn!(issue_id = issue.id, error = %e, "assessment failed");
                    errors.push(IssueError {
                        issue_id: issue.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let remaining = self
            .db
            .call(move |db| db.count_pending_assessment(repo_id))
            .await
            .map_err(ScoutError::Database)?;
        Ok(BatchAnalysis {
            analyzed: results.len(),
            remaining,
            results,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::factory::models::{Assessment, Source};
    use crate::factory::test_support::{Harness, tracker_item};
    use anyhow::Result;

    const CAPABLE: &str = r#"{"assessment": "agentic_pr_capable", "summary": "Null check in the login handler."}"#;

    #[tokio::test]
    async fn test_analyze_issue_records_verdict_and_model() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash on login", false).await?;
        h.model.push_reply(format!("```json\n{}\n```", CAPABLE));

        let issue = h.analyzer.analyze_issue(issue.id, Some("gpt-5.2")).await?;
        assert_eq!(issue.assessment, Assessment::AgenticPrCapable);
        assert_eq!(issue.summary.as_deref(), Some("Null check in the login handler."));
        assert_eq!(issue.analysis_model.as_deref(), Some("gpt-5.2"));
        assert!(issue.analyzed_at.is_some());

        let prompts = h.model.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].1.contains("Crash on login"));
        Ok(())
    }

    #[tokio::test]
    async fn test_analyze_uses_setting_when_no_model_given() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", false).await?;
        h.db.call(|db| db.set_setting(SETTING_ASSESSMENT_MODEL, "claude-sonnet-4-5"))
            .await?;
        h.model.push_reply(CAPABLE);

        h.analyzer.analyze_issue(issue.id, None).await?;
        assert_eq!(h.model.prompts()[0].0, "claude-sonnet-4-5");
        Ok(())
    }

    #[tokio::test]
    async fn test_two_bad_replies_leave_issue_pending() -> Result<()> {
        let h = Harness::new().await?;
        let (_, issue) = h.seed_issue("42", "Crash", false).await?;
        h.model.push_reply("I think it is easy.");
        h.model.push_reply(r#"{"assessment": "maybe", "summary": "?"}"#);

        let err = h.analyzer.analyze_issue(issue.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("after retry"));
        assert_eq!(h.model.prompts().len(), 2);
        assert_eq!(h.issue(issue.id).await?.assessment, Assessment::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_reports_item_errors_and_remaining() -> Result<()> {
        let h = Harness::new().await?;
        let repo = h.add_repo(Source::Github, "acme/widgets", false).await?;
        let items: Vec<_> = (1..=7)
            .map(|i| tracker_item(&i.to_string(), &format!("Issue {}", i)))
            .collect();
        h.add_issues(&repo, items).await?;

        h.model.push_reply(CAPABLE);
        h.model.push_error("503 overloaded");
        for _ in 0..3 {
            h.model.push_reply(r#"{"assessment": "too_complex", "summary": "Needs design work."}"#);
        }

        let batch = h.analyzer.analyze_batch(repo.id, None).await?;
        assert_eq!(batch.analyzed, 4);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].error.contains("503 overloaded"));
        // Two never attempted plus the one that failed.
        assert_eq!(batch.remaining, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_targets_are_not_found() -> Result<()> {
        let h = Harness::new().await?;
        assert_eq!(
            h.analyzer.analyze_issue(9, None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            h.analyzer.analyze_batch(9, None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        Ok(())
    }
}
