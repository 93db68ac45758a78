//! Scout run orchestrator.
//!
//! ## Overview
//!
//! Scout mirrors open issues from GitHub and Linear into a local SQLite
//! store, launches a coding agent against one issue at a time in an
//! isolated git worktree, and follows each run until the agent reports back
//! or an operator cancels it.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Operator │ ───────> │  server.rs  (build_services, build_router)       │
//! │  / Agent │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │                                        │
//!                       │         │ launch / callback / cancel             │
//!                       │         v                                        │
//!                       │  launcher.rs ── workspace.rs (git worktrees)     │
//!                       │       │      └─ process.rs   (detached agent)    │
//!                       │  callback.rs    (apply terminal report once)     │
//!                       │  cancel.rs      (DB first, then TERM/KILL)       │
//!                       │                                                  │
//!                       │  scheduler.rs ── sync.rs ── tracker.rs           │
//!                       │                      ├─ github.rs (REST)         │
//!                       │                      └─ linear.rs (GraphQL)      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                          |
//! |----------------|---------------------------------------------------------|
//! | `models`       | Shared types: `Repo`, `Issue`, `Callback`, status enums |
//! | `db`           | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `repos`        | Repo registration checks                                |
//! | `prompts`      | Prompt templates with `{{var}}` and `{{#flag}}` blocks  |
//! | `context`      | Per-launch `RunContext`                                 |
//! | `ai`           | Model providers, model selection, assessment replies    |
//! | `analyze`      | Issue assessment, single and batched                    |
//!
//! ## Run Lifecycle
//!
//! 1. `POST /api/issues/{id}/launch` → `RunLauncher::launch()` creates the
//!    worktree, writes prompts, marks the issue `in_progress` together with
//!    a `pending` callback row, then spawns the agent tagged with
//!    `SCOUT_RUN_ID=<callback id>`.
//! 2. The agent calls `/api/callback` once. `CallbackGateway` moves the
//!    issue to its terminal `pr_status` and reclaims the worktree.
//! 3. Or the operator cancels: `CancellationController` marks the callback
//!    `cancelled` first, so a late report is ignored, then stops every
//!    process carrying the run's tag.
//! 4. Runs that ended with a pushed branch are later matched to open PRs by
//!    the PR detection pass of `SyncEngine`.

pub mod ai;
pub mod analyze;
pub mod api;
pub mod callback;
pub mod cancel;
pub mod context;
pub mod db;
pub mod github;
pub mod launcher;
pub mod linear;
pub mod models;
pub mod process;
pub mod prompts;
pub mod repos;
pub mod scheduler;
pub mod server;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tracker;
pub mod workspace;
