//! In-memory doubles for the collaborators at the orchestrator's edges.
//!
//! Each fake records what it was asked to do and can be scripted to fail,
//! so scenario tests can drive launch, callback, cancel and sync end to end
//! without git, child processes or network access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use super::ai::{ModelClient, ModelResolver};
use super::analyze::Analyzer;
use super::api::AppState;
use super::callback::CallbackGateway;
use super::cancel::CancellationController;
use super::db::{DbHandle, ScoutDb};
use super::launcher::{AgentCommand, RunLauncher};
use super::models::{Assessment, Callback, Issue, NewRepo, Repo, RepoUpdate, Source, TrackerItem};
use super::process::{ProcessSupervisor, RUN_TAG_VAR, SignalKind, SpawnSpec};
use super::prompts::PromptSet;
use super::sync::SyncEngine;
use super::tracker::{PagePosition, PullRequestRef, TrackerClient, TrackerPage, TrackerSet};
use super::workspace::{VcsTool, WorkspaceManager};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── VcsTool ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum VcsCall {
    Fetch {
        remote: String,
        reference: String,
    },
    AddWorktree {
        branch: String,
        path: PathBuf,
        base_ref: String,
    },
    RemoveWorktree {
        path: PathBuf,
        force: bool,
    },
    Prune,
}

#[derive(Default)]
struct VcsState {
    calls: Vec<VcsCall>,
    fetch_error: Option<String>,
    add_errors: VecDeque<String>,
    remove_error: Option<String>,
}

/// Fake git: worktree creation makes a real directory so filesystem
/// checks in the code under test behave as they would with git.
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn calls(&self) -> Vec<VcsCall> {
        locked(&self.state).calls.clone()
    }

    pub fn fail_fetch(&self, message: &str) {
        locked(&self.state).fetch_error = Some(message.to_string());
    }

    /// Queue a failure for the next `add_worktree`. Queued failures are
    /// consumed in order.
    pub fn fail_next_add(&self, message: &str) {
        locked(&self.state).add_errors.push_back(message.to_string());
    }

    /// Make every `remove_worktree` fail without touching the directory.
    pub fn fail_removes(&self, message: &str) {
        locked(&self.state).remove_error = Some(message.to_string());
    }
}

#[async_trait]
impl VcsTool for FakeVcs {
    async fn fetch(&self, _repo_root: &Path, remote: &str, reference: &str) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(VcsCall::Fetch {
            remote: remote.to_string(),
            reference: reference.to_string(),
        });
        match &state.fetch_error {
            Some(msg) => anyhow::bail!("{}", msg),
            None => Ok(()),
        }
    }

    async fn add_worktree(
        &self,
        _repo_root: &Path,
        new_branch: &str,
        path: &Path,
        base_ref: &str,
    ) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(VcsCall::AddWorktree {
            branch: new_branch.to_string(),
            path: path.to_path_buf(),
            base_ref: base_ref.to_string(),
        });
        if let Some(msg) = state.add_errors.pop_front() {
            anyhow::bail!("{}", msg);
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn remove_worktree(&self, _repo_root: &Path, path: &Path, force: bool) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(VcsCall::RemoveWorktree {
            path: path.to_path_buf(),
            force,
        });
        if let Some(msg) = &state.remove_error {
            anyhow::bail!("{}", msg);
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    async fn prune_worktrees(&self, _repo_root: &Path) -> Result<()> {
        locked(&self.state).calls.push(VcsCall::Prune);
        Ok(())
    }
}

// ── ProcessSupervisor ─────────────────────────────────────────────────

struct SupervisorState {
    spawns: Vec<SpawnSpec>,
    next_pid: u32,
    tagged: HashMap<String, Vec<u32>>,
    signals: Vec<(u32, SignalKind)>,
    spawn_error: Option<String>,
    ignores_terminate: HashSet<u32>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            spawns: Vec::new(),
            next_pid: 4000,
            tagged: HashMap::new(),
            signals: Vec::new(),
            spawn_error: None,
            ignores_terminate: HashSet::new(),
        }
    }
}

/// Fake process table. A spawned process is registered under the value of
/// its `SCOUT_RUN_ID` variable and disappears when signalled, unless it was
/// told to ignore SIGTERM.
#[derive(Default)]
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
}

impl FakeSupervisor {
    pub fn spawns(&self) -> Vec<SpawnSpec> {
        locked(&self.state).spawns.clone()
    }

    pub fn signals(&self) -> Vec<(u32, SignalKind)> {
        locked(&self.state).signals.clone()
    }

    pub fn fail_spawn(&self, message: &str) {
        locked(&self.state).spawn_error = Some(message.to_string());
    }

    pub fn allow_spawn(&self) {
        locked(&self.state).spawn_error = None;
    }

    /// Register an extra live process under `tag` (e.g. an agent's child).
    pub fn add_tagged(&self, tag: &str, pid: u32) {
        locked(&self.state)
            .tagged
            .entry(tag.to_string())
            .or_default()
            .push(pid);
    }

    /// Keep `pid` alive through SIGTERM; only SIGKILL removes it.
    pub fn ignore_terminate(&self, pid: u32) {
        locked(&self.state).ignores_terminate.insert(pid);
    }

    pub fn live_tagged(&self, tag: &str) -> Vec<u32> {
        locked(&self.state)
            .tagged
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn_detached(&self, spec: &SpawnSpec) -> Result<u32> {
        let mut state = locked(&self.state);
        if let Some(msg) = &state.spawn_error {
            anyhow::bail!("{}", msg);
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.spawns.push(spec.clone());
        if let Some((_, tag)) = spec.env.iter().find(|(k, _)| k == RUN_TAG_VAR) {
            state.tagged.entry(tag.clone()).or_default().push(pid);
        }
        Ok(pid)
    }

    async fn list_tagged(&self, tag: &str) -> Result<Vec<u32>> {
        Ok(self.live_tagged(tag))
    }

    async fn signal(&self, pid: u32, kind: SignalKind) -> Result<()> {
        let mut state = locked(&self.state);
        state.signals.push((pid, kind));
        let dies = kind == SignalKind::Kill || !state.ignores_terminate.contains(&pid);
        if dies {
            for pids in state.tagged.values_mut() {
                pids.retain(|p| *p != pid);
            }
        }
        Ok(())
    }
}

// ── TrackerClient ─────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerState {
    items: HashMap<String, Vec<TrackerItem>>,
    pulls: HashMap<String, Vec<PullRequestRef>>,
    fetch_errors: VecDeque<String>,
    fetches: Vec<(String, u32, PagePosition)>,
}

/// Fake tracker serving a fixed item list, paginated either by page
/// number or by an offset-encoding cursor.
pub struct FakeTracker {
    cursor_paged: bool,
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    /// Page-numbered, like GitHub search.
    pub fn paged() -> Self {
        Self {
            cursor_paged: false,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Cursor-paginated, like Linear.
    pub fn cursored() -> Self {
        Self {
            cursor_paged: true,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn set_items(&self, repo_ref: &str, items: Vec<TrackerItem>) {
        locked(&self.state)
            .items
            .insert(repo_ref.to_string(), items);
    }

    pub fn set_pull_requests(&self, repo_ref: &str, pulls: Vec<PullRequestRef>) {
        locked(&self.state)
            .pulls
            .insert(repo_ref.to_string(), pulls);
    }

    pub fn fail_next_fetch(&self, message: &str) {
        locked(&self.state)
            .fetch_errors
            .push_back(message.to_string());
    }

    /// Every `list_open_items` call as `(repo_ref, page_size, position)`.
    pub fn fetches(&self) -> Vec<(String, u32, PagePosition)> {
        locked(&self.state).fetches.clone()
    }
}

/// Build a plain open item with deterministic fields.
pub fn tracker_item(source_id: &str, title: &str) -> TrackerItem {
    TrackerItem {
        source_id: source_id.to_string(),
        source_url: format!("https://tracker.example/{}", source_id),
        title: title.to_string(),
        description: format!("{} description", title),
        labels: vec!["bug".to_string()],
        priority: "medium".to_string(),
        status: "open".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

#[async_trait]
impl TrackerClient for FakeTracker {
    async fn list_open_items(
        &self,
        repo_ref: &str,
        page_size: u32,
        position: &PagePosition,
    ) -> Result<TrackerPage> {
        let mut state = locked(&self.state);
        state
            .fetches
            .push((repo_ref.to_string(), page_size, position.clone()));
        if let Some(msg) = state.fetch_errors.pop_front() {
            anyhow::bail!("{}", msg);
        }

        let size = page_size.max(1) as usize;
        let start = match (self.cursor_paged, position) {
            (false, PagePosition::Page(p)) => ((*p).max(1) - 1) as usize * size,
            (true, PagePosition::Cursor(None)) => 0,
            (true, PagePosition::Cursor(Some(c))) => c.parse::<usize>()?,
            _ => anyhow::bail!("unexpected position {:?}", position),
        };
        let all = state.items.get(repo_ref).cloned().unwrap_or_default();
        let end = (start + size).min(all.len());
        let items = all.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let has_next = end < all.len();
        let next_position = match position {
            PagePosition::Page(p) => PagePosition::Page(p + 1),
            PagePosition::Cursor(_) => PagePosition::Cursor(Some(end.to_string())),
        };
        Ok(TrackerPage {
            items,
            has_next,
            next_position,
        })
    }

    async fn list_open_pull_requests(&self, repo_ref: &str) -> Result<Vec<PullRequestRef>> {
        Ok(locked(&self.state)
            .pulls
            .get(repo_ref)
            .cloned()
            .unwrap_or_default())
    }
}

// ── ModelClient ───────────────────────────────────────────────────────

#[derive(Default)]
struct ModelState {
    replies: VecDeque<std::result::Result<String, String>>,
    prompts: Vec<(String, String)>,
}

/// Fake model that returns scripted replies in order.
#[derive(Default)]
pub struct FakeModel {
    state: Mutex<ModelState>,
}

impl FakeModel {
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        for reply in replies {
            model.push_reply(reply);
        }
        model
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        locked(&self.state).replies.push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, message: &str) {
        locked(&self.state)
            .replies
            .push_back(Err(message.to_string()));
    }

    /// Every call as `(model, prompt)`.
    pub fn prompts(&self) -> Vec<(String, String)> {
        locked(&self.state).prompts.clone()
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let mut state = locked(&self.state);
        state.prompts.push((model.to_string(), prompt.to_string()));
        match state.replies.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(msg)) => anyhow::bail!("{}", msg),
            None => anyhow::bail!("no scripted model reply left"),
        }
    }
}

// ── Harness ───────────────────────────────────────────────────────────

/// Page size the harness sync engine starts every repo with.
pub const HARNESS_PAGE_SIZE: u32 = 3;

/// Every component wired to an in-memory database and the fakes above,
/// with real scratch and checkout directories on disk.
pub struct Harness {
    pub db: DbHandle,
    pub vcs: Arc<FakeVcs>,
    pub supervisor: Arc<FakeSupervisor>,
    pub github: Arc<FakeTracker>,
    pub linear: Arc<FakeTracker>,
    pub model: Arc<FakeModel>,
    pub workspaces: Arc<WorkspaceManager>,
    pub launcher: Arc<RunLauncher>,
    pub gateway: Arc<CallbackGateway>,
    pub canceller: Arc<CancellationController>,
    pub sync: Arc<SyncEngine>,
    pub analyzer: Arc<Analyzer>,
    pub resolver: ModelResolver,
    scratch: TempDir,
    checkout: TempDir,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        let db = DbHandle::new(ScoutDb::new_in_memory()?);
        let scratch = TempDir::new()?;
        let checkout = TempDir::new()?;

        let vcs = Arc::new(FakeVcs::default());
        let supervisor = Arc::new(FakeSupervisor::default());
        let github = Arc::new(FakeTracker::paged());
        let linear = Arc::new(FakeTracker::cursored());
        let model = Arc::new(FakeModel::default());
        let prompts = Arc::new(PromptSet::builtin()?);
        let resolver = ModelResolver::default();

        let workspaces = Arc::new(WorkspaceManager::new(
            vcs.clone(),
            scratch.path().join("scout-worktrees"),
            "origin",
        ));
        let launcher = Arc::new(RunLauncher::new(
            db.clone(),
            workspaces.clone(),
            supervisor.clone(),
            prompts.clone(),
            resolver,
            AgentCommand {
                program: "scout-agent".to_string(),
                leading_args: Vec::new(),
                callback_url: "http://127.0.0.1:3141/api/callback".to_string(),
            },
            scratch.path().join("scout-runs"),
        ));
        let gateway = Arc::new(CallbackGateway::new(db.clone(), workspaces.clone()));
        let canceller = Arc::new(CancellationController::new(
            db.clone(),
            workspaces.clone(),
            supervisor.clone(),
            Duration::from_millis(10),
        ));
        let trackers = TrackerSet {
            github: github.clone(),
            linear: linear.clone(),
        };
        let sync = Arc::new(SyncEngine::new(db.clone(), trackers, HARNESS_PAGE_SIZE, "origin"));
        let analyzer = Arc::new(Analyzer::new(db.clone(), model.clone(), prompts, resolver));

        Ok(Self {
            db,
            vcs,
            supervisor,
            github,
            linear,
            model,
            workspaces,
            launcher,
            gateway,
            canceller,
            sync,
            analyzer,
            resolver,
            scratch,
            checkout,
        })
    }

    /// Router state sharing this harness's components.
    pub fn app_state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            launcher: self.launcher.clone(),
            gateway: self.gateway.clone(),
            canceller: self.canceller.clone(),
            sync: self.sync.clone(),
            analyzer: self.analyzer.clone(),
            models: self.resolver,
        }
    }

    pub fn checkout_path(&self) -> &Path {
        self.checkout.path()
    }

    /// Register a repo whose local checkout is the harness checkout dir.
    pub async fn add_repo(&self, source: Source, source_id: &str, auto_pr: bool) -> Result<Repo> {
        let new = NewRepo {
            source,
            source_id: source_id.to_string(),
            name: source_id.to_string(),
            local_path: Some(self.checkout.path().display().to_string()),
            default_branch: None,
            default_mode: None,
            auto_create_pr: auto_pr,
        };
        self.db.call(move |db| db.create_repo(&new)).await
    }

    /// Store tracker items directly, leaving the repo's cursor as it was.
    pub async fn add_issues(&self, repo: &Repo, items: Vec<TrackerItem>) -> Result<Vec<Issue>> {
        let (repo_id, source) = (repo.id, repo.source);
        let ids: Vec<String> = items.iter().map(|i| i.source_id.clone()).collect();
        self.db
            .call(move |db| db.upsert_issues(repo_id, source, &items))
            .await?;
        let all = self.all_issues(repo_id).await?;
        Ok(all
            .into_iter()
            .filter(|issue| ids.contains(&issue.source_id))
            .collect())
    }

    /// One GitHub repo (`acme/widgets`) holding one open issue.
    pub async fn seed_issue(&self, source_id: &str, title: &str, auto_pr: bool) -> Result<(Repo, Issue)> {
        let repo = self.add_repo(Source::Github, "acme/widgets", auto_pr).await?;
        let issue = self
            .add_issues(&repo, vec![tracker_item(source_id, title)])
            .await?
            .pop()
            .context("seeded issue missing")?;
        Ok((repo, issue))
    }

    pub async fn all_issues(&self, repo_id: i64) -> Result<Vec<Issue>> {
        let page = self.db.call(move |db| db.list_issues(repo_id, 1, 200)).await?;
        Ok(page.issues)
    }

    pub async fn issue(&self, id: i64) -> Result<Issue> {
        self.db
            .call(move |db| db.get_issue(id))
            .await?
            .with_context(|| format!("issue {} not found", id))
    }

    pub async fn callback(&self, callback_id: &str) -> Result<Callback> {
        let id = callback_id.to_string();
        let record = self
            .db
            .call(move |db| db.get_callback(&id))
            .await?
            .with_context(|| format!("callback {} not found", callback_id))?;
        Ok(record.callback)
    }

    pub async fn record_assessment(&self, issue_id: i64, assessment: Assessment) -> Result<()> {
        self.db
            .call(move |db| db.record_assessment(issue_id, assessment, "seeded", "test-model"))
            .await?;
        Ok(())
    }

    pub async fn set_local_path(&self, repo_id: i64, path: &str) -> Result<()> {
        let update = RepoUpdate {
            local_path: Some(path.to_string()),
            ..RepoUpdate::default()
        };
        self.db
            .call(move |db| db.update_repo(repo_id, &update))
            .await?
            .context("repo not found")?;
        Ok(())
    }

    /// Workspace directories currently on disk, across all repos.
    pub fn workspace_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for repo_dir in list_dirs(&self.scratch.path().join("scout-worktrees"))? {
            dirs.extend(list_dirs(&repo_dir)?);
        }
        Ok(dirs)
    }

    /// Run directories (prompt files, agent log) currently on disk.
    pub fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        list_dirs(&self.scratch.path().join("scout-runs"))
    }
}

fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
