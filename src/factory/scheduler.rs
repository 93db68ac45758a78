//! Background polling: one task syncs every repo, another looks for PRs
//! opened by finished runs. A cycle that is still running when its next
//! tick arrives makes that tick a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sync::{BatchReport, PrCheckResult, SyncEngine, SyncPageResult};

/// Held for the duration of one cycle; released on drop.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    sync: Arc<SyncEngine>,
    sync_interval: Duration,
    pr_interval: Duration,
    sync_running: AtomicBool,
    pr_running: AtomicBool,
}

impl Scheduler {
    pub fn new(sync: Arc<SyncEngine>, sync_interval: Duration, pr_interval: Duration) -> Self {
        Self {
            sync,
            sync_interval,
            pr_interval,
            sync_running: AtomicBool::new(false),
            pr_running: AtomicBool::new(false),
        }
    }

    /// One sync pass over every repo. `None` when a pass is already running.
    pub async fn run_sync_cycle(&self) -> Option<BatchReport<SyncPageResult>> {
        let Some(_guard) = CycleGuard::try_acquire(&self.sync_running) else {
            debug!("sync cycle still running, skipping tick");
            return None;
        };
        match self.sync.sync_all().await {
            Ok(report) => {
                let new: usize = report.results.iter().map(|r| r.new).sum();
                info!(repos = report.results.len(), failed = report.errors.len(), new, "sync cycle finished");
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "sync cycle failed");
                None
            }
        }
    }

    /// One PR detection pass over every repo. `None` when a pass is already running.
    pub async fn run_pr_cycle(&self) -> Option<BatchReport<PrCheckResult>> {
        let Some(_guard) = CycleGuard::try_acquire(&self.pr_running) else {
            debug!("PR check cycle still running, skipping tick");
            return None;
        };
        match self.sync.detect_prs_all().await {
            Ok(report) => {
                let updated: usize = report.results.iter().map(|r| r.updated).sum();
                if updated > 0 || !report.errors.is_empty() {
                    info!(updated, failed = report.errors.len(), "PR check cycle finished");
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "PR check cycle failed");
                None
            }
        }
    }

    /// Start both polling tasks. They stop when `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let sync_task = {
            let this = self.clone();
            let token = token.clone();
            let period = self.sync_interval;
            tokio::spawn(async move {
                poll(period, token, || this.run_sync_cycle()).await;
            })
        };
        let pr_task = {
            let this = self.clone();
            let period = self.pr_interval;
            tokio::spawn(async move {
                poll(period, token, || this.run_pr_cycle()).await;
            })
        };
        info!(
            sync_secs = self.sync_interval.as_secs(),
            pr_check_secs = self.pr_interval.as_secs(),
            "scheduler started"
        );
        vec![sync_task, pr_task]
    }
}

async fn poll<F, Fut, T>(period: Duration, token: CancellationToken, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = cycle() => {}
                }
            }
        }
    }
    debug!("polling task stopped");
}
