//! Run Launcher: turns an issue into a running agent.
//!
//! A launch resolves its inputs, creates the workspace, writes the rendered
//! prompts, reserves the issue (issue `in_progress` + `pending` callback in
//! one transaction) and finally spawns the agent detached. Any failure after
//! the workspace exists undoes everything done so far before the error is
//! returned, so a failed launch leaves no workspace, no prompt files and no
//! `in_progress` issue behind.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::ai::{ModelResolver, SETTING_AGENT_MODEL, provider_model_id};
use super::context::RunContext;
use super::db::{DbHandle, NewRun, Reservation};
use super::process::{ProcessSupervisor, RUN_TAG_VAR, SpawnSpec};
use super::prompts::{PromptKind, PromptSet};
use super::workspace::WorkspaceManager;
use crate::errors::{ScoutError, ScoutResult};

/// Setting key for the reviewer model; falls back to the agent model.
pub const SETTING_REVIEW_MODEL: &str = "review_model";

const TITLE_SLUG_LEN: usize = 50;

/// Lowercase ASCII slug: runs of anything else collapse to one `-`, the
/// result is trimmed and cut to at most `max_len` bytes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug = text
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// `scout/<tracker id>-<title slug>-<first 8 of callback id>`.
pub fn branch_name(source_id: &str, title: &str, callback_id: &str) -> String {
    let suffix: String = callback_id.chars().take(8).collect();
    let parts: Vec<String> = [slugify(source_id, 20), slugify(title, TITLE_SLUG_LEN), suffix]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    format!("scout/{}", parts.join("-"))
}

/// How the agent binary is invoked and where it reports back.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    /// Placed before the generated run arguments.
    pub leading_args: Vec<String>,
    /// Full URL of the callback endpoint.
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReceipt {
    pub callback_id: String,
    pub branch_name: String,
    pub workspace_path: PathBuf,
    pub pid: u32,
}

pub struct RunLauncher {
    db: DbHandle,
    workspaces: Arc<WorkspaceManager>,
    supervisor: Arc<dyn ProcessSupervisor>,
    prompts: Arc<PromptSet>,
    resolver: ModelResolver,
    agent: AgentCommand,
    runs_root: PathBuf,
}

impl RunLauncher {
    pub fn new(
        db: DbHandle,
        workspaces: Arc<WorkspaceManager>,
        supervisor: Arc<dyn ProcessSupervisor>,
        prompts: Arc<PromptSet>,
        resolver: ModelResolver,
        agent: AgentCommand,
        runs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            workspaces,
            supervisor,
            prompts,
            resolver,
            agent,
            runs_root: runs_root.into(),
        }
    }

    pub async fn launch(
        &self,
        issue_id: i64,
        context_note: Option<String>,
    ) -> ScoutResult<LaunchReceipt> {
        let ctx = self.prepare(issue_id, context_note).await?;

        let workspace = self
            .workspaces
            .create_workspace(
                ctx.repo_root(),
                ctx.repo.id,
                &ctx.callback_id,
                &ctx.branch_name,
                &ctx.repo.default_branch,
            )
            .await?;

        match self.start(&ctx, &workspace).await {
            Ok(pid) => {
                info!(
                    issue_id,
                    callback_id = %ctx.callback_id,
                    branch = %ctx.branch_name,
                    pid,
                    "launched agent"
                );
                Ok(LaunchReceipt {
                    callback_id: ctx.callback_id,
                    branch_name: ctx.branch_name,
                    workspace_path: workspace,
                    pid,
                })
            }
            Err(e) => {
                warn!(issue_id, callback_id = %ctx.callback_id, error = %e, "launch failed, cleaning up");
                self.discard(&ctx, &workspace).await;
                Err(e)
            }
        }
    }

    /// Validate preconditions and resolve every input. No side effects.
    async fn prepare(&self, issue_id: i64, context_note: Option<String>) -> ScoutResult<RunContext> {
        let (issue, repo, pending, agent_setting, review_setting) = self
            .db
            .call(move |db| {
                let issue = db.get_issue(issue_id)?;
                let repo = match &issue {
                    Some(i) => db.get_repo(i.repo_id)?,
                    None => None,
                };
                let pending = db.pending_callbacks_for_issue(issue_id)?;
                Ok((
                    issue,
                    repo,
                    pending,
                    db.get_setting(SETTING_AGENT_MODEL)?,
                    db.get_setting(SETTING_REVIEW_MODEL)?,
                ))
            })
            .await
            .map_err(ScoutError::Database)?;

        let issue = issue.ok_or_else(|| ScoutError::not_found("Issue", issue_id))?;
        let repo = repo.ok_or_else(|| ScoutError::not_found("Repo", issue.repo_id))?;
        if let Some(existing) = pending.first() {
            return Err(ScoutError::Conflict(format!(
                "Issue {} already has a pending run ({}); cancel it before launching again",
                issue_id, existing.callback_id
            )));
        }

        let repo_root = match repo.local_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => {
                return Err(ScoutError::Validation(format!(
                    "Repo {} has no local checkout configured",
                    repo.name
                )));
            }
        };
        if !repo_root.is_dir() {
            return Err(ScoutError::Validation(format!(
                "Local checkout {} for repo {} does not exist",
                repo_root.display(),
                repo.name
            )));
        }

        let agent_model = self
            .resolver
            .agent_model(None, agent_setting.as_deref());
        let review_model = match review_setting.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => agent_model.clone(),
        };

        let callback_id = Uuid::new_v4().simple().to_string();
        let branch_name = branch_name(&issue.source_id, &issue.title, &callback_id);
        let run_dir = self.runs_root.join(&callback_id);
        Ok(RunContext {
            issue,
            repo,
            repo_root,
            callback_id,
            branch_name,
            run_dir,
            agent_model: provider_model_id(&agent_model).to_string(),
            review_model: provider_model_id(&review_model).to_string(),
            context_note,
        })
    }

    /// Everything after the workspace exists. The caller undoes the work on
    /// error.
    async fn start(&self, ctx: &RunContext, workspace: &std::path::Path) -> ScoutResult<u32> {
        self.write_prompts(ctx, workspace).await?;

        let run = NewRun {
            issue_id: ctx.issue.id,
            callback_id: ctx.callback_id.clone(),
            branch_name: ctx.branch_name.clone(),
            worktree_path: workspace.display().to_string(),
            repo_root_path: ctx.repo_root.display().to_string(),
        };
        let reservation = self
            .db
            .call(move |db| db.reserve_run(&run))
            .await
            .map_err(ScoutError::Database)?;
        match reservation {
            Reservation::Reserved(_) => {}
            Reservation::IssueMissing => return Err(ScoutError::not_found("Issue", ctx.issue.id)),
            Reservation::AlreadyPending(other) => {
                return Err(ScoutError::Conflict(format!(
                    "Issue {} already has a pending run ({})",
                    ctx.issue.id, other
                )));
            }
        }

        let spec = self.spawn_spec(ctx, workspace);
        match self.supervisor.spawn_detached(&spec).await {
            Ok(pid) => Ok(pid),
            Err(e) => {
                let message = format!("Failed to start agent: {:#}", e);
                match self.release(&ctx.callback_id, &message).await {
                    Ok(()) => Err(ScoutError::Resource(message)),
                    Err(release_err) => Err(ScoutError::Resource(format!(
                        "{}; releasing run {} also failed ({:#}), so issue {} still shows it as \
                         pending until `scout cancel {}`",
                        message, ctx.callback_id, release_err, ctx.issue.id, ctx.issue.id
                    ))),
                }
            }
        }
    }

    /// Undo a reservation whose agent never started. Tried twice.
    async fn release(&self, callback_id: &str, error: &str) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            let (id, err) = (callback_id.to_string(), error.to_string());
            match self
                .db
                .call(move |db| db.release_failed_launch(&id, &err))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 2 => {
                    warn!(callback_id, error = %format!("{:#}", e), "failed to release reservation, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_prompts(&self, ctx: &RunContext, workspace: &std::path::Path) -> ScoutResult<()> {
        tokio::fs::create_dir_all(&ctx.run_dir).await.map_err(|e| {
            ScoutError::Resource(format!("Failed to create {}: {}", ctx.run_dir.display(), e))
        })?;
        let values = ctx.template_context(workspace);
        for kind in PromptKind::ALL {
            let path = ctx.prompt_path(kind);
            let text = self.prompts.template(kind).render(&values);
            tokio::fs::write(&path, text).await.map_err(|e| {
                ScoutError::Resource(format!("Failed to write {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    fn spawn_spec(&self, ctx: &RunContext, workspace: &std::path::Path) -> SpawnSpec {
        let path = |p: PathBuf| p.display().to_string();
        let mut args = self.agent.leading_args.clone();
        let pairs = [
            ("--workspace", workspace.display().to_string()),
            ("--repo-root", ctx.repo_root.display().to_string()),
            ("--implement-prompt", path(ctx.prompt_path(PromptKind::Implement))),
            ("--review-prompt", path(ctx.prompt_path(PromptKind::Review))),
            ("--rework-prompt", path(ctx.prompt_path(PromptKind::Rework))),
            ("--pr-prompt", path(ctx.prompt_path(PromptKind::PullRequest))),
            ("--callback-url", self.agent.callback_url.clone()),
            ("--callback-id", ctx.callback_id.clone()),
            ("--model", ctx.agent_model.clone()),
            ("--review-model", ctx.review_model.clone()),
            ("--mode", ctx.repo.default_mode.clone()),
            ("--auto-pr", ctx.repo.auto_create_pr.to_string()),
        ];
        for (flag, value) in pairs {
            args.push(flag.to_string());
            args.push(value);
        }
        SpawnSpec {
            program: self.agent.program.clone(),
            args,
            env: vec![
                (RUN_TAG_VAR.to_string(), ctx.callback_id.clone()),
                ("SCOUT_CALLBACK_URL".to_string(), self.agent.callback_url.clone()),
            ],
            cwd: workspace.to_path_buf(),
            log_path: Some(ctx.log_path()),
        }
    }

    async fn discard(&self, ctx: &RunContext, workspace: &std::path::Path) {
        self.workspaces
            .destroy_workspace(ctx.repo_root(), workspace)
            .await;
        if ctx.run_dir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&ctx.run_dir).await
        {
            warn!(path = %ctx.run_dir.display(), error = %e, "failed to remove run directory");
        }
    }
}
