use std::path::{Path, PathBuf};

use super::models::{Issue, Repo, Source};
use super::prompts::{PromptKind, TemplateContext};

/// Everything one launch needs, resolved up front and passed explicitly
/// through workspace creation, prompt rendering and process spawn.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub issue: Issue,
    pub repo: Repo,
    pub repo_root: PathBuf,
    pub callback_id: String,
    pub branch_name: String,
    /// `<scratch>/scout-runs/<callback_id>`: prompt files and the agent log.
    pub run_dir: PathBuf,
    pub agent_model: String,
    pub review_model: String,
    pub context_note: Option<String>,
}

impl RunContext {
    pub fn prompt_path(&self, kind: PromptKind) -> PathBuf {
        self.run_dir.join(kind.file_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join("agent.log")
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Placeholder values and section flags for the run prompts.
    pub fn template_context(&self, workspace: &Path) -> TemplateContext {
        let note = self
            .context_note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        TemplateContext::new()
            .value("issue_title", &self.issue.title)
            .value("issue_description", &self.issue.description)
            .value("issue_labels", self.issue.labels.join(", "))
            .value("issue_url", &self.issue.source_url)
            .value("source_id", &self.issue.source_id)
            .value("priority", &self.issue.priority)
            .value("repo_name", &self.repo.name)
            .value("default_branch", &self.repo.default_branch)
            .value("branch_name", &self.branch_name)
            .value("worktree_path", workspace.display().to_string())
            .value("context", note.unwrap_or_default())
            .flag("is_github", self.repo.source == Source::Github)
            .flag("is_linear", self.repo.source == Source::Linear)
            .flag("auto_pr", self.repo.auto_create_pr)
            .flag("has_context", note.is_some())
    }
}
