use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the Scout database.
///
/// Wraps `ScoutDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. The mutex also linearizes
/// every read-modify-write the launcher, gateway and cancellation controller
/// perform, since each of those runs as one closure under one transaction.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ScoutDb>>,
}

impl DbHandle {
    pub fn new(db: ScoutDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ScoutDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ScoutDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct ScoutDb {
    conn: Connection,
}

/// Result of trying to reserve an issue for a new run.
#[derive(Debug)]
pub enum Reservation {
    Reserved(Callback),
    IssueMissing,
    /// Another run for the issue is still pending; carries its callback id.
    AlreadyPending(String),
}

/// Result of applying an agent's terminal report.
#[derive(Debug)]
pub enum CallbackApplication {
    Unknown,
    Cancelled(Callback),
    AlreadyProcessed(Callback),
    Applied {
        callback: Callback,
        pr_status: PrStatus,
    },
}

/// Inputs for `reserve_run`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub issue_id: i64,
    pub callback_id: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub repo_root_path: String,
}

const ISSUE_COLUMNS: &str = "id, repo_id, source, source_id, source_url, title, description, \
     labels, priority, status, summary, assessment, pr_status, pr_url, pr_branch, \
     analysis_model, created_at, updated_at, analyzed_at";

const CALLBACK_COLUMNS: &str = "c.id, c.callback_id, c.issue_id, c.status, c.worktree_path, \
     c.repo_root_path, c.branch_name, c.error, c.created_at, c.completed_at";

const REPO_COLUMNS: &str =
    "id, source, source_id, name, local_path, default_branch, default_mode, auto_create_pr, created_at";

impl ScoutDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal mode")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source TEXT NOT NULL CHECK (source IN ('github', 'linear')),
                    source_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    local_path TEXT,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    auto_create_pr INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(source, source_id)
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                    source TEXT NOT NULL CHECK (source IN ('github', 'linear')),
                    source_id TEXT NOT NULL,
                    source_url TEXT NOT NULL DEFAULT '',
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    labels TEXT NOT NULL DEFAULT '[]',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'open',
                    summary TEXT,
                    assessment TEXT NOT NULL DEFAULT 'pending'
                        CHECK (assessment IN ('pending', 'agentic_pr_capable', 'too_complex')),
                    pr_status TEXT NOT NULL DEFAULT 'none'
                        CHECK (pr_status IN ('none', 'in_progress', 'branch_pushed',
                                             'pr_created', 'needs_review', 'failed')),
                    pr_url TEXT,
                    pr_branch TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    analyzed_at TEXT,
                    UNIQUE(repo_id, source, source_id)
                );

                CREATE TABLE IF NOT EXISTS callbacks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    callback_id TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'complete', 'failed',
                                          'needs_review', 'cancelled')),
                    worktree_path TEXT,
                    repo_root_path TEXT,
                    branch_name TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS repo_sync_state (
                    repo_id INTEGER PRIMARY KEY REFERENCES repos(id) ON DELETE CASCADE,
                    next_page INTEGER NOT NULL DEFAULT 1,
                    next_cursor TEXT,
                    page_size INTEGER NOT NULL DEFAULT 50,
                    has_more INTEGER NOT NULL DEFAULT 1,
                    last_fetch_count INTEGER NOT NULL DEFAULT 0,
                    last_fetch_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_issues_repo_id ON issues(repo_id);
                CREATE INDEX IF NOT EXISTS idx_issues_assessment ON issues(repo_id, assessment);
                CREATE INDEX IF NOT EXISTS idx_callbacks_issue_id ON callbacks(issue_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_callbacks_one_pending
                    ON callbacks(issue_id) WHERE status = 'pending';
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (safe to re-run). Only "duplicate column" is ignored.
        self.add_column("repos", "default_mode TEXT NOT NULL DEFAULT 'standard'")?;
        self.add_column("issues", "analysis_model TEXT")?;
        self.add_column("callbacks", "error TEXT")?;

        Ok(())
    }

    fn add_column(&self, table: &str, definition: &str) -> Result<()> {
        match self
            .conn
            .execute(&format!("ALTER TABLE {} ADD COLUMN {}", table, definition), [])
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column") => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to add column {} to {}: {}",
                definition,
                table,
                e
            )),
        }
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub fn create_repo(&self, repo: &NewRepo) -> Result<Repo> {
        self.conn
            .execute(
                "INSERT INTO repos (source, source_id, name, local_path, default_branch, default_mode, auto_create_pr)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    repo.source.as_str(),
                    repo.source_id,
                    repo.name,
                    repo.local_path,
                    repo.default_branch.as_deref().unwrap_or("main"),
                    repo.default_mode.as_deref().unwrap_or("standard"),
                    repo.auto_create_pr,
                ],
            )
            .with_context(|| {
                format!("Failed to insert repo {}:{}", repo.source, repo.source_id)
            })?;
        let id = self.conn.last_insert_rowid();
        self.get_repo(id)?.context("Repo not found after insert")
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM repos ORDER BY id", REPO_COLUMNS))
            .context("Failed to prepare list_repos")?;
        let rows = stmt
            .query_map([], RepoRow::read)
            .context("Failed to query repos")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repo row")?.into_repo()?);
        }
        Ok(repos)
    }

    pub fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM repos WHERE id = ?1", REPO_COLUMNS),
                params![id],
                RepoRow::read,
            )
            .optional()
            .context("Failed to query repo")?;
        row.map(RepoRow::into_repo).transpose()
    }

    pub fn find_repo(&self, source: Source, source_id: &str) -> Result<Option<Repo>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM repos WHERE source = ?1 AND source_id = ?2",
                    REPO_COLUMNS
                ),
                params![source.as_str(), source_id],
                RepoRow::read,
            )
            .optional()
            .context("Failed to query repo")?;
        row.map(RepoRow::into_repo).transpose()
    }

    /// Apply operator edits. Returns `None` when the repo doesn't exist.
    pub fn update_repo(&self, id: i64, update: &RepoUpdate) -> Result<Option<Repo>> {
        // Use unchecked_transaction so all updates are atomic.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(path) = &update.local_path {
            tx.execute(
                "UPDATE repos SET local_path = ?1 WHERE id = ?2",
                params![path, id],
            )
            .context("Failed to update repo local_path")?;
        }
        if let Some(branch) = &update.default_branch {
            tx.execute(
                "UPDATE repos SET default_branch = ?1 WHERE id = ?2",
                params![branch, id],
            )
            .context("Failed to update repo default_branch")?;
        }
        if let Some(mode) = &update.default_mode {
            tx.execute(
                "UPDATE repos SET default_mode = ?1 WHERE id = ?2",
                params![mode, id],
            )
            .context("Failed to update repo default_mode")?;
        }
        if let Some(auto_pr) = update.auto_create_pr {
            tx.execute(
                "UPDATE repos SET auto_create_pr = ?1 WHERE id = ?2",
                params![auto_pr, id],
            )
            .context("Failed to update repo auto_create_pr")?;
        }

        tx.commit().context("Failed to commit repo update")?;
        self.get_repo(id)
    }

    // ── Issues ────────────────────────────────────────────────────────

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        fetch_issue(&self.conn, id)
    }

    /// Newest-first page of a repo's issues. `page` is 1-based.
    pub fn list_issues(&self, repo_id: i64, page: u32, per_page: u32) -> Result<IssuePage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 200);
        let total: u64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM issues WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get::<_, i64>(0),
            )
            .context("Failed to count issues")? as u64;

        let offset = (page as i64 - 1) * per_page as i64;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE repo_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(params![repo_id, per_page, offset], IssueRow::read)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }

        Ok(IssuePage {
            issues,
            page,
            per_page,
            total,
            total_pages: total.div_ceil(per_page as u64),
        })
    }

    /// Upsert one tracker page and advance the repo's sync cursor in a
    /// single transaction. Either every row and the new cursor are visible,
    /// or nothing changed.
    ///
    /// The cursor only moves to `next` while it still sits where `from`
    /// found it. If another sync advanced or reset it in the meantime, the
    /// rows are stored and the newer cursor is kept.
    pub fn store_issue_page(
        &self,
        repo_id: i64,
        source: Source,
        items: &[TrackerItem],
        from: &RepoSyncState,
        next: &RepoSyncState,
    ) -> Result<StoredPage> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let counts = upsert_items(&tx, repo_id, source, items)?;

        let current = read_sync_state(&tx, repo_id)?;
        let cursor_advanced = current.as_ref().is_none_or(|c| c.same_position(from));
        if cursor_advanced {
            write_sync_state(&tx, next)?;
        }
        tx.commit().context("Failed to commit issue page")?;

        let cursor = match (cursor_advanced, current) {
            (false, Some(current)) => current,
            _ => next.clone(),
        };
        Ok(StoredPage {
            counts,
            cursor_advanced,
            cursor,
        })
    }

    /// Upsert tracker items without touching the sync cursor.
    pub fn upsert_issues(
        &self,
        repo_id: i64,
        source: Source,
        items: &[TrackerItem],
    ) -> Result<UpsertCounts> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let counts = upsert_items(&tx, repo_id, source, items)?;
        tx.commit().context("Failed to commit issues")?;
        Ok(counts)
    }


    /// Issues whose run may have produced a PR that we haven't seen yet.
    pub fn issues_awaiting_pr(&self, repo_id: i64) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues
                 WHERE repo_id = ?1
                   AND pr_branch IS NOT NULL AND pr_branch != ''
                   AND pr_status IN ('in_progress', 'branch_pushed')
                 ORDER BY id",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare issues_awaiting_pr")?;
        let rows = stmt
            .query_map(params![repo_id], IssueRow::read)
            .context("Failed to query issues awaiting PR")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    /// Record a PR found by branch match. The status guard means a run that
    /// was cancelled or finalized since the scan started is left alone.
    pub fn record_detected_pr(&self, issue_id: i64, pr_url: &str, status: PrStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE issues SET pr_url = ?1, pr_status = ?2, updated_at = datetime('now')
                 WHERE id = ?3 AND pr_status IN ('in_progress', 'branch_pushed')",
                params![pr_url, status.as_str(), issue_id],
            )
            .context("Failed to record detected PR")?;
        Ok(changed > 0)
    }

    pub fn pending_assessment(&self, repo_id: i64, limit: u32) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE repo_id = ?1 AND assessment = 'pending'
                 ORDER BY id LIMIT ?2",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare pending_assessment")?;
        let rows = stmt
            .query_map(params![repo_id, limit], IssueRow::read)
            .context("Failed to query pending issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    pub fn count_pending_assessment(&self, repo_id: i64) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM issues WHERE repo_id = ?1 AND assessment = 'pending'",
                params![repo_id],
                |row| row.get(0),
            )
            .context("Failed to count pending issues")?;
        Ok(count as u64)
    }

    pub fn record_assessment(
        &self,
        issue_id: i64,
        assessment: Assessment,
        summary: &str,
        model: &str,
    ) -> Result<Option<Issue>> {
        self.conn
            .execute(
                "UPDATE issues SET summary = ?1, assessment = ?2, analysis_model = ?3,
                     analyzed_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?4",
                params![summary, assessment.as_str(), model, issue_id],
            )
            .context("Failed to record assessment")?;
        self.get_issue(issue_id)
    }

    // ── Sync state ────────────────────────────────────────────────────

    /// Load the repo's cursor, creating it with defaults on first use.
    pub fn get_or_create_sync_state(&self, repo_id: i64, page_size: u32) -> Result<RepoSyncState> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO repo_sync_state (repo_id, page_size) VALUES (?1, ?2)",
                params![repo_id, page_size],
            )
            .context("Failed to create sync state")?;
        read_sync_state(&self.conn, repo_id)?
            .with_context(|| format!("Sync state for repo {} vanished", repo_id))
    }

    /// Rewind a repo's cursor so the next sync starts from the first page.
    pub fn reset_sync_state(&self, repo_id: i64, page_size: u32) -> Result<RepoSyncState> {
        let mut state = RepoSyncState::initial(repo_id);
        state.page_size = page_size;
        write_sync_state(&self.conn, &state)?;
        self.get_or_create_sync_state(repo_id, page_size)
    }

    // ── Runs and callbacks ────────────────────────────────────────────

    /// Atomically mark the issue in progress and insert its pending callback.
    /// Refuses when another run for the issue is still pending.
    pub fn reserve_run(&self, run: &NewRun) -> Result<Reservation> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM issues WHERE id = ?1",
                params![run.issue_id],
                |row| row.get(0),
            )
            .context("Failed to check issue")?;
        if !exists {
            return Ok(Reservation::IssueMissing);
        }

        let pending: Option<String> = tx
            .query_row(
                "SELECT callback_id FROM callbacks WHERE issue_id = ?1 AND status = 'pending'",
                params![run.issue_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check pending callbacks")?;
        if let Some(callback_id) = pending {
            return Ok(Reservation::AlreadyPending(callback_id));
        }

        tx.execute(
            "UPDATE issues SET pr_status = 'in_progress', pr_branch = ?1, pr_url = NULL,
                 updated_at = datetime('now')
             WHERE id = ?2",
            params![run.branch_name, run.issue_id],
        )
        .context("Failed to mark issue in progress")?;
        tx.execute(
            "INSERT INTO callbacks (issue_id, callback_id, status, worktree_path, repo_root_path, branch_name)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            params![
                run.issue_id,
                run.callback_id,
                run.worktree_path,
                run.repo_root_path,
                run.branch_name
            ],
        )
        .context("Failed to insert callback")?;

        let callback = fetch_callback(&tx, &run.callback_id)?
            .context("Callback not found after insert")?;
        tx.commit().context("Failed to commit run reservation")?;
        Ok(Reservation::Reserved(callback.callback))
    }

    /// Undo a reservation whose agent never started. The callback is kept as
    /// `failed` for diagnostics; the issue goes back to `none` unless a
    /// different run has claimed it since.
    pub fn release_failed_launch(&self, callback_id: &str, error: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let Some(record) = fetch_callback(&tx, callback_id)? else {
            return Ok(());
        };
        let changed = tx
            .execute(
                "UPDATE callbacks SET status = 'failed', error = ?1, completed_at = datetime('now')
                 WHERE callback_id = ?2 AND status = 'pending'",
                params![error, callback_id],
            )
            .context("Failed to release callback")?;
        if changed > 0 {
            tx.execute(
                "UPDATE issues SET pr_status = 'none', pr_branch = NULL, pr_url = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND pr_branch IS ?2",
                params![record.callback.issue_id, record.callback.branch_name],
            )
            .context("Failed to reset issue after failed launch")?;
        }

        tx.commit().context("Failed to commit launch release")?;
        Ok(())
    }

    pub fn get_callback(&self, callback_id: &str) -> Result<Option<CallbackRecord>> {
        fetch_callback(&self.conn, callback_id)
    }

    pub fn pending_callbacks_for_issue(&self, issue_id: i64) -> Result<Vec<Callback>> {
        pending_callbacks(&self.conn, issue_id)
    }

    /// Apply an agent's terminal report as one read-modify-write.
    ///
    /// Only a `pending` callback changes anything; cancelled and already
    /// finalized callbacks are reported back untouched.
    pub fn apply_callback(
        &self,
        callback_id: &str,
        reported: ReportedStatus,
        pr_url: Option<&str>,
        error: Option<&str>,
    ) -> Result<CallbackApplication> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let Some(record) = fetch_callback(&tx, callback_id)? else {
            return Ok(CallbackApplication::Unknown);
        };
        match record.callback.status {
            CallbackStatus::Pending => {}
            CallbackStatus::Cancelled => return Ok(CallbackApplication::Cancelled(record.callback)),
            _ => return Ok(CallbackApplication::AlreadyProcessed(record.callback)),
        }

        let pr_status = PrStatus::from_report(reported, record.auto_create_pr, pr_url.is_some());
        tx.execute(
            "UPDATE issues SET pr_status = ?1, pr_url = COALESCE(?2, pr_url),
                 updated_at = datetime('now')
             WHERE id = ?3",
            params![pr_status.as_str(), pr_url, record.callback.issue_id],
        )
        .context("Failed to update issue from callback")?;
        tx.execute(
            "UPDATE callbacks SET status = ?1, error = ?2, completed_at = datetime('now')
             WHERE id = ?3 AND status = 'pending'",
            params![reported.as_callback_status().as_str(), error, record.callback.id],
        )
        .context("Failed to finalize callback")?;

        let callback = fetch_callback(&tx, callback_id)?
            .context("Callback vanished during update")?
            .callback;
        tx.commit().context("Failed to commit callback")?;
        Ok(CallbackApplication::Applied {
            callback,
            pr_status,
        })
    }

    /// Mark every pending callback for the issue `cancelled` and reset the
    /// issue's run fields, atomically. Returns the callbacks that were
    /// pending (so their processes and workspaces can be reclaimed), or
    /// `None` when the issue doesn't exist.
    pub fn cancel_pending_for_issue(&self, issue_id: i64) -> Result<Option<Vec<Callback>>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM issues WHERE id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .context("Failed to check issue")?;
        if !exists {
            return Ok(None);
        }

        let pending = pending_callbacks(&tx, issue_id)?;
        tx.execute(
            "UPDATE callbacks SET status = 'cancelled', completed_at = datetime('now')
             WHERE issue_id = ?1 AND status = 'pending'",
            params![issue_id],
        )
        .context("Failed to cancel callbacks")?;
        tx.execute(
            "UPDATE issues SET pr_status = 'none', pr_url = NULL, pr_branch = NULL,
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![issue_id],
        )
        .context("Failed to reset issue")?;

        tx.commit().context("Failed to commit cancellation")?;
        Ok(Some(pending))
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    /// Run raw SQL. Tests use this to install failure triggers.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to execute raw SQL")
    }
}

// ── Internal query helpers (shared by plain and transactional paths) ──

fn fetch_issue(conn: &Connection, id: i64) -> Result<Option<Issue>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLUMNS),
            params![id],
            IssueRow::read,
        )
        .optional()
        .context("Failed to query issue")?;
    row.map(IssueRow::into_issue).transpose()
}

fn fetch_callback(conn: &Connection, callback_id: &str) -> Result<Option<CallbackRecord>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {}, r.auto_create_pr
                 FROM callbacks c
                 JOIN issues i ON c.issue_id = i.id
                 JOIN repos r ON i.repo_id = r.id
                 WHERE c.callback_id = ?1",
                CALLBACK_COLUMNS
            ),
            params![callback_id],
            |row| Ok((CallbackRow::read(row)?, row.get::<_, bool>(10)?)),
        )
        .optional()
        .context("Failed to query callback")?;
    match row {
        Some((callback, auto_create_pr)) => Ok(Some(CallbackRecord {
            callback: callback.into_callback()?,
            auto_create_pr,
        })),
        None => Ok(None),
    }
}

fn pending_callbacks(conn: &Connection, issue_id: i64) -> Result<Vec<Callback>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM callbacks c WHERE c.issue_id = ?1 AND c.status = 'pending' ORDER BY c.id",
            CALLBACK_COLUMNS
        ))
        .context("Failed to prepare pending_callbacks")?;
    let rows = stmt
        .query_map(params![issue_id], CallbackRow::read)
        .context("Failed to query pending callbacks")?;
    let mut callbacks = Vec::new();
    for row in rows {
        callbacks.push(row.context("Failed to read callback row")?.into_callback()?);
    }
    Ok(callbacks)
}

/// Existing rows only get tracker-owned fields refreshed; assessment and
/// the run fields (`pr_status`, `pr_url`, `pr_branch`) are never written.
fn upsert_items(
    conn: &Connection,
    repo_id: i64,
    source: Source,
    items: &[TrackerItem],
) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    for item in items {
        let labels = serde_json::to_string(&item.labels).context("Failed to encode labels")?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM issues WHERE repo_id = ?1 AND source = ?2 AND source_id = ?3",
                params![repo_id, source.as_str(), item.source_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up issue")?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE issues SET title = ?1, description = ?2, labels = ?3,
                         source_url = ?4, status = ?5, priority = ?6,
                         updated_at = datetime('now')
                     WHERE id = ?7",
                    params![
                        item.title,
                        item.description,
                        labels,
                        item.source_url,
                        item.status,
                        item.priority,
                        id
                    ],
                )
                .with_context(|| format!("Failed to update issue {}", item.source_id))?;
                counts.updated += 1;
            }
            None => {
                conn.execute(
                    "INSERT INTO issues (repo_id, source, source_id, source_url, title,
                         description, labels, priority, status, assessment, pr_status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 'none', ?10)",
                    params![
                        repo_id,
                        source.as_str(),
                        item.source_id,
                        item.source_url,
                        item.title,
                        item.description,
                        labels,
                        item.priority,
                        item.status,
                        item.created_at
                    ],
                )
                .with_context(|| format!("Failed to insert issue {}", item.source_id))?;
                counts.new += 1;
            }
        }
    }
    Ok(counts)
}

fn read_sync_state(conn: &Connection, repo_id: i64) -> Result<Option<RepoSyncState>> {
    conn.query_row(
        "SELECT repo_id, next_page, next_cursor, page_size, has_more,
                last_fetch_count, last_fetch_at
         FROM repo_sync_state WHERE repo_id = ?1",
        params![repo_id],
        |row| {
            Ok(RepoSyncState {
                repo_id: row.get(0)?,
                next_page: row.get(1)?,
                next_cursor: row.get(2)?,
                page_size: row.get(3)?,
                has_more: row.get(4)?,
                last_fetch_count: row.get(5)?,
                last_fetch_at: row.get(6)?,
            })
        },
    )
    .optional()
    .context("Failed to read sync state")
}

fn write_sync_state(conn: &Connection, state: &RepoSyncState) -> Result<()> {
    conn.execute(
        "INSERT INTO repo_sync_state (repo_id, next_page, next_cursor, page_size, has_more,
             last_fetch_count, last_fetch_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(repo_id) DO UPDATE SET
             next_page = excluded.next_page,
             next_cursor = excluded.next_cursor,
             page_size = excluded.page_size,
             has_more = excluded.has_more,
             last_fetch_count = excluded.last_fetch_count,
             last_fetch_at = excluded.last_fetch_at",
        params![
            state.repo_id,
            state.next_page,
            state.next_cursor,
            state.page_size,
            state.has_more,
            state.last_fetch_count,
            state.last_fetch_at
        ],
    )
    .context("Failed to write sync state")?;
    Ok(())
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Raw repo row before the source string is parsed.
struct RepoRow {
    id: i64,
    source: String,
    source_id: String,
    name: String,
    local_path: Option<String>,
    default_branch: String,
    default_mode: String,
    auto_create_pr: bool,
    created_at: String,
}

impl RepoRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            source_id: row.get(2)?,
            name: row.get(3)?,
            local_path: row.get(4)?,
            default_branch: row.get(5)?,
            default_mode: row.get(6)?,
            auto_create_pr: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_repo(self) -> Result<Repo> {
        let source = Source::from_str(&self.source)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse repo source")?;
        Ok(Repo {
            id: self.id,
            source,
            source_id: self.source_id,
            name: self.name,
            local_path: self.local_path,
            default_branch: self.default_branch,
            default_mode: self.default_mode,
            auto_create_pr: self.auto_create_pr,
            created_at: self.created_at,
        })
    }
}

/// Intermediate row struct for reading issues from SQLite before converting
/// enum columns and the labels JSON into typed values.
struct IssueRow {
    id: i64,
    repo_id: i64,
    source: String,
    source_id: String,
    source_url: String,
    title: String,
    description: String,
    labels: String,
    priority: String,
    status: String,
    summary: Option<String>,
    assessment: String,
    pr_status: String,
    pr_url: Option<String>,
    pr_branch: Option<String>,
    analysis_model: Option<String>,
    created_at: String,
    updated_at: String,
    analyzed_at: Option<String>,
}

impl IssueRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            source: row.get(2)?,
            source_id: row.get(3)?,
            source_url: row.get(4)?,
            title: row.get(5)?,
            description: row.get(6)?,
            labels: row.get(7)?,
            priority: row.get(8)?,
            status: row.get(9)?,
            summary: row.get(10)?,
            assessment: row.get(11)?,
            pr_status: row.get(12)?,
            pr_url: row.get(13)?,
            pr_branch: row.get(14)?,
            analysis_model: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            analyzed_at: row.get(18)?,
        })
    }

    fn into_issue(self) -> Result<Issue> {
        let source = Source::from_str(&self.source)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue source")?;
        let assessment = Assessment::from_str(&self.assessment)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue assessment")?;
        let pr_status = PrStatus::from_str(&self.pr_status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue pr_status")?;
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Failed to parse issue labels JSON")?;

        Ok(Issue {
            id: self.id,
            repo_id: self.repo_id,
            source,
            source_id: self.source_id,
            source_url: self.source_url,
            title: self.title,
            description: self.description,
            labels,
            priority: self.priority,
            status: self.status,
            summary: self.summary,
            assessment,
            pr_status,
            pr_url: self.pr_url,
            pr_branch: self.pr_branch,
            analysis_model: self.analysis_model,
            created_at: self.created_at,
            updated_at: self.updated_at,
            analyzed_at: self.analyzed_at,
        })
    }
}

struct CallbackRow {
    id: i64,
    callback_id: String,
    issue_id: i64,
    status: String,
    worktree_path: Option<String>,
    repo_root_path: Option<String>,
    branch_name: Option<String>,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl CallbackRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            callback_id: row.get(1)?,
            issue_id: row.get(2)?,
            status: row.get(3)?,
            worktree_path: row.get(4)?,
            repo_root_path: row.get(5)?,
            branch_name: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_callback(self) -> Result<Callback> {
        let status = CallbackStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse callback status")?;
        Ok(Callback {
            id: self.id,
            callback_id: self.callback_id,
            issue_id: self.issue_id,
            status,
            worktree_path: self.worktree_path,
            repo_root_path: self.repo_root_path,
            branch_name: self.branch_name,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn github_repo(db: &ScoutDb, auto_create_pr: bool) -> Result<Repo> {
        db.create_repo(&NewRepo {
            source: Source::Github,
            source_id: "acme/widgets".into(),
            name: "widgets".into(),
            local_path: Some("/srv/widgets".into()),
            default_branch: None,
            default_mode: None,
            auto_create_pr,
        })
    }

    fn item(source_id: &str, title: &str) -> TrackerItem {
        TrackerItem {
            source_id: source_id.into(),
            source_url: format!("https://github.com/acme/widgets/issues/{}", source_id),
            title: title.into(),
            description: String::new(),
            labels: vec!["bug".into()],
            priority: "medium".into(),
            status: "open".into(),
            created_at: "2026-01-05T10:00:00Z".into(),
        }
    }

    fn seed_issue(db: &ScoutDb, repo: &Repo, source_id: &str) -> Result<Issue> {
        db.upsert_issues(repo.id, repo.source, &[item(source_id, "Seeded")])?;
        let page = db.list_issues(repo.id, 1, 200)?;
        page.issues
            .into_iter()
            .find(|i| i.source_id == source_id)
            .context("seeded issue missing")
    }

    fn new_run(issue_id: i64, callback_id: &str) -> NewRun {
        NewRun {
            issue_id,
            callback_id: callback_id.into(),
            branch_name: format!("scout/42-fix-{}", callback_id),
            worktree_path: format!("/tmp/scout-worktrees/1/{}", callback_id),
            repo_root_path: "/srv/widgets".into(),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('settings', 'repos', 'issues', 'callbacks', 'repo_sync_state')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5);

        // Re-running migrations is harmless.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_file_database_uses_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = ScoutDb::new(&dir.path().join("scout.db"))?;
        let mode: String = db.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        assert_eq!(mode.to_lowercase(), "wal");
        Ok(())
    }

    #[test]
    fn test_create_and_update_repo() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        assert_eq!(repo.default_branch, "main");
        assert_eq!(repo.default_mode, "standard");
        assert!(!repo.auto_create_pr);

        let updated = db
            .update_repo(
                repo.id,
                &RepoUpdate {
                    auto_create_pr: Some(true),
                    default_branch: Some("develop".into()),
                    ..Default::default()
                },
            )?
            .expect("repo should exist");
        assert!(updated.auto_create_pr);
        assert_eq!(updated.default_branch, "develop");
        assert_eq!(updated.local_path.as_deref(), Some("/srv/widgets"));

        assert!(db.update_repo(999, &RepoUpdate::default())?.is_none());
        assert_eq!(db.list_repos()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_repo_is_rejected() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        assert!(github_repo(&db, false).is_err());
        let found = db.find_repo(Source::Github, &repo.source_id)?;
        assert_eq!(found.map(|r| r.id), Some(repo.id));
        assert!(db.find_repo(Source::Linear, &repo.source_id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_upsert_page_inserts_and_advances_cursor() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let from = db.get_or_create_sync_state(repo.id, 50)?;
        let mut next = from.clone();
        next.next_page = 2;
        next.last_fetch_count = 2;

        let stored = db.store_issue_page(
            repo.id,
            Source::Github,
            &[item("1", "First"), item("2", "Second")],
            &from,
            &next,
        )?;
        assert_eq!(stored.counts, UpsertCounts { new: 2, updated: 0 });
        assert!(stored.cursor_advanced);

        let state = db.get_or_create_sync_state(repo.id, 50)?;
        assert_eq!(state.next_page, 2);
        assert_eq!(state.last_fetch_count, 2);

        let page = db.list_issues(repo.id, 1, 50)?;
        assert_eq!(page.total, 2);
        assert!(page.issues.iter().all(|i| i.assessment == Assessment::Pending));
        assert!(page.issues.iter().all(|i| i.pr_status == PrStatus::None));
        Ok(())
    }

    #[test]
    fn test_stale_page_keeps_newer_cursor() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let from = db.get_or_create_sync_state(repo.id, 50)?;

        // Another sync stores page 1 and moves the cursor to page 2 first.
        let mut first = from.clone();
        first.next_page = 2;
        db.store_issue_page(repo.id, Source::Github, &[item("1", "First")], &from, &first)?;

        // The slower sync started from the same cursor and would rewind it.
        let mut stale = from.clone();
        stale.next_page = 2;
        stale.has_more = false;
        let stored =
            db.store_issue_page(repo.id, Source::Github, &[item("1", "First again")], &from, &stale)?;
        assert!(!stored.cursor_advanced);
        assert_eq!(stored.counts, UpsertCounts { new: 0, updated: 1 });
        assert!(stored.cursor.same_position(&first));

        let state = db.get_or_create_sync_state(repo.id, 50)?;
        assert_eq!(state.next_page, 2);
        assert!(state.has_more);
        assert_eq!(db.list_issues(repo.id, 1, 50)?.issues[0].title, "First again");
        Ok(())
    }

    #[test]
    fn test_upsert_preserves_local_fields() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, true)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.record_assessment(issue.id, Assessment::AgenticPrCapable, "Easy fix", "gpt-5.2")?;
        db.conn.execute(
            "UPDATE issues SET pr_status = 'pr_created', pr_url = 'https://x/pull/7',
                 pr_branch = 'scout/42-x' WHERE id = ?1",
            params![issue.id],
        )?;

        let mut refreshed = item("42", "Renamed upstream");
        refreshed.labels = vec!["bug".into(), "p1".into()];
        refreshed.status = "closed".into();
        let counts = db.upsert_issues(repo.id, Source::Github, &[refreshed])?;
        assert_eq!(counts, UpsertCounts { new: 0, updated: 1 });

        let after = db.get_issue(issue.id)?.expect("issue");
        assert_eq!(after.title, "Renamed upstream");
        assert_eq!(after.labels, vec!["bug".to_string(), "p1".to_string()]);
        assert_eq!(after.status, "closed");
        assert_eq!(after.assessment, Assessment::AgenticPrCapable);
        assert_eq!(after.pr_status, PrStatus::PrCreated);
        assert_eq!(after.pr_url.as_deref(), Some("https://x/pull/7"));
        assert_eq!(after.pr_branch.as_deref(), Some("scout/42-x"));
        assert_eq!(after.summary.as_deref(), Some("Easy fix"));
        Ok(())
    }

    #[test]
    fn test_failed_page_rolls_back_rows_and_cursor() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let before = db.get_or_create_sync_state(repo.id, 50)?;
        db.execute_raw(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON issues WHEN NEW.title = 'boom'
             BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
        )?;

        let mut next = before.clone();
        next.next_page = 2;
        let result = db.store_issue_page(
            repo.id,
            Source::Github,
            &[item("1", "fine"), item("2", "boom")],
            &before,
            &next,
        );
        assert!(result.is_err());

        assert_eq!(db.list_issues(repo.id, 1, 50)?.total, 0);
        assert_eq!(db.get_or_create_sync_state(repo.id, 50)?, before);
        Ok(())
    }

    #[test]
    fn test_same_tracker_id_in_two_repos() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let a = github_repo(&db, false)?;
        let b = db.create_repo(&NewRepo {
            source: Source::Github,
            source_id: "acme/gadgets".into(),
            name: "gadgets".into(),
            local_path: None,
            default_branch: None,
            default_mode: None,
            auto_create_pr: false,
        })?;
        seed_issue(&db, &a, "1")?;
        seed_issue(&db, &b, "1")?;
        assert_eq!(db.list_issues(a.id, 1, 10)?.total, 1);
        assert_eq!(db.list_issues(b.id, 1, 10)?.total, 1);
        Ok(())
    }

    #[test]
    fn test_list_issues_pagination() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let items: Vec<TrackerItem> = (1..=5)
            .map(|n| {
                let mut it = item(&n.to_string(), &format!("Issue {}", n));
                it.created_at = format!("2026-01-0{}T00:00:00Z", n);
                it
            })
            .collect();
        db.upsert_issues(repo.id, Source::Github, &items)?;

        let page = db.list_issues(repo.id, 2, 2)?;
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        let ids: Vec<&str> = page.issues.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
        Ok(())
    }

    #[test]
    fn test_reset_sync_state() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let before = db.get_or_create_sync_state(repo.id, 50)?;
        let mut exhausted = before.clone();
        exhausted.has_more = false;
        exhausted.next_page = 9;
        db.store_issue_page(repo.id, Source::Github, &[], &before, &exhausted)?;

        let reset = db.reset_sync_state(repo.id, 50)?;
        assert!(reset.has_more);
        assert_eq!(reset.next_page, 1);
        assert!(reset.next_cursor.is_none());
        Ok(())
    }

    #[test]
    fn test_reserve_run_marks_issue_and_inserts_pending() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;

        let Reservation::Reserved(callback) = db.reserve_run(&new_run(issue.id, "cb1"))? else {
            panic!("expected reservation");
        };
        assert_eq!(callback.status, CallbackStatus::Pending);

        let issue = db.get_issue(issue.id)?.expect("issue");
        assert_eq!(issue.pr_status, PrStatus::InProgress);
        assert_eq!(issue.pr_branch.as_deref(), Some("scout/42-fix-cb1"));
        Ok(())
    }

    #[test]
    fn test_reserve_run_refuses_second_pending() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;

        match db.reserve_run(&new_run(issue.id, "cb2"))? {
            Reservation::AlreadyPending(id) => assert_eq!(id, "cb1"),
            other => panic!("expected AlreadyPending, got {:?}", other),
        }
        assert!(matches!(
            db.reserve_run(&new_run(999, "cb3"))?,
            Reservation::IssueMissing
        ));
        Ok(())
    }

    #[test]
    fn test_pending_index_rejects_direct_duplicate() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;
        let dup = db.conn.execute(
            "INSERT INTO callbacks (issue_id, callback_id, status) VALUES (?1, 'cb2', 'pending')",
            params![issue.id],
        );
        assert!(dup.is_err());
        Ok(())
    }

    #[test]
    fn test_apply_callback_is_idempotent() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, true)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;

        let first = db.apply_callback(
            "cb1",
            ReportedStatus::Complete,
            Some("https://github.com/acme/widgets/pull/7"),
            None,
        )?;
        assert!(matches!(
            first,
            CallbackApplication::Applied {
                pr_status: PrStatus::PrCreated,
                ..
            }
        ));
        let after_first = db.get_issue(issue.id)?.expect("issue");

        let second = db.apply_callback("cb1", ReportedStatus::Failed, None, Some("late"))?;
        assert!(matches!(second, CallbackApplication::AlreadyProcessed(_)));
        let after_second = db.get_issue(issue.id)?.expect("issue");
        assert_eq!(after_first.pr_status, after_second.pr_status);
        assert_eq!(after_first.pr_url, after_second.pr_url);

        let record = db.get_callback("cb1")?.expect("callback");
        assert_eq!(record.callback.status, CallbackStatus::Complete);
        assert!(record.callback.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_apply_callback_records_failure_text() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;

        db.apply_callback("cb1", ReportedStatus::Failed, None, Some("tests did not pass"))?;
        let record = db.get_callback("cb1")?.expect("callback");
        assert_eq!(record.callback.status, CallbackStatus::Failed);
        assert_eq!(record.callback.error.as_deref(), Some("tests did not pass"));
        assert_eq!(db.get_issue(issue.id)?.expect("issue").pr_status, PrStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_unknown_callback() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        assert!(matches!(
            db.apply_callback("nope", ReportedStatus::Complete, None, None)?,
            CallbackApplication::Unknown
        ));
        Ok(())
    }

    #[test]
    fn test_cancel_then_callback_is_ignored() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, true)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;

        let cancelled = db.cancel_pending_for_issue(issue.id)?.expect("issue exists");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].callback_id, "cb1");

        let late = db.apply_callback("cb1", ReportedStatus::Complete, Some("https://x/pull/1"), None)?;
        assert!(matches!(late, CallbackApplication::Cancelled(_)));

        let issue = db.get_issue(issue.id)?.expect("issue");
        assert_eq!(issue.pr_status, PrStatus::None);
        assert!(issue.pr_url.is_none());
        assert!(issue.pr_branch.is_none());
        Ok(())
    }

    #[test]
    fn test_cancel_unknown_issue() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        assert!(db.cancel_pending_for_issue(404)?.is_none());
        Ok(())
    }

    #[test]
    fn test_release_failed_launch_resets_issue() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;

        db.release_failed_launch("cb1", "agent binary missing")?;
        let record = db.get_callback("cb1")?.expect("callback");
        assert_eq!(record.callback.status, CallbackStatus::Failed);
        let issue = db.get_issue(issue.id)?.expect("issue");
        assert_eq!(issue.pr_status, PrStatus::None);
        assert!(issue.pr_branch.is_none());

        // The issue can be launched again.
        assert!(matches!(
            db.reserve_run(&new_run(issue.id, "cb2"))?,
            Reservation::Reserved(_)
        ));
        Ok(())
    }

    #[test]
    fn test_detected_pr_respects_status_guard() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        let issue = seed_issue(&db, &repo, "42")?;
        db.reserve_run(&new_run(issue.id, "cb1"))?;
        assert_eq!(db.issues_awaiting_pr(repo.id)?.len(), 1);

        assert!(db.record_detected_pr(issue.id, "https://x/pull/3", PrStatus::NeedsReview)?);
        assert!(db.issues_awaiting_pr(repo.id)?.is_empty());
        // Already finalized: a second detection changes nothing.
        assert!(!db.record_detected_pr(issue.id, "https://x/pull/4", PrStatus::PrCreated)?);
        Ok(())
    }

    #[test]
    fn test_assessment_queries() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        let repo = github_repo(&db, false)?;
        for n in 1..=3 {
            seed_issue(&db, &repo, &n.to_string())?;
        }
        assert_eq!(db.count_pending_assessment(repo.id)?, 3);
        let batch = db.pending_assessment(repo.id, 2)?;
        assert_eq!(batch.len(), 2);

        let analyzed = db
            .record_assessment(batch[0].id, Assessment::TooComplex, "Needs design", "gpt-5.2")?
            .expect("issue");
        assert_eq!(analyzed.assessment, Assessment::TooComplex);
        assert_eq!(analyzed.analysis_model.as_deref(), Some("gpt-5.2"));
        assert!(analyzed.analyzed_at.is_some());
        assert_eq!(db.count_pending_assessment(repo.id)?, 2);
        Ok(())
    }

    #[test]
    fn test_settings_round_trip() -> Result<()> {
        let db = ScoutDb::new_in_memory()?;
        assert!(db.get_setting("assessment_model")?.is_none());
        db.set_setting("assessment_model", "gpt-4o-mini")?;
        db.set_setting("assessment_model", "claude-sonnet-4-5")?;
        assert_eq!(
            db.get_setting("assessment_model")?.as_deref(),
            Some("claude-sonnet-4-5")
        );
        db.delete_setting("assessment_model")?;
        assert!(db.get_setting("assessment_model")?.is_none());
        Ok(())
    }
}
