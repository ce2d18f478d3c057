//! Backup scheduler that runs one cycle per interval.
//!
//! Cycles never overlap: the loop awaits each cycle before taking the next
//! tick, and missed ticks are delayed rather than bursted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use kubesnap_core::errors::SyncError;
use kubesnap_core::models::CycleReport;
use kubesnap_core::BackupEngine;

/// Tracks aggregate statistics across backup cycles.
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub total_commits: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
    pub timeouts: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            total_cycles: AtomicU64::new(0),
            total_commits: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }
}

/// Why a scheduled cycle produced no report.
#[derive(Debug)]
pub enum CycleFailure {
    Failed(SyncError),
    TimedOut(Duration),
    Panicked(String),
}

impl std::fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(d) => write!(f, "cycle exceeded deadline of {}s", d.as_secs()),
            Self::Panicked(msg) => write!(f, "cycle task panicked: {msg}"),
        }
    }
}

/// The backup scheduler.
pub struct Scheduler {
    engine: Arc<BackupEngine>,
    interval: Duration,
    cycle_timeout: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: Arc<BackupEngine>, interval: Duration, cycle_timeout: Duration) -> Self {
        Self {
            engine,
            interval,
            cycle_timeout,
            stats: Arc::new(SchedulerStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. The first cycle starts immediately; the loop
    /// exits once `shutdown` is notified, after any in-flight cycle.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("scheduler received shutdown, not scheduling further cycles");
                    break;
                }
                _ = interval.tick() => {
                    let _ = self.run_cycle().await;
                }
            }
        }
    }

    /// Run one cycle on the blocking pool under the cycle deadline.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleFailure> {
        let cycle_num = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle = cycle_num, "starting backup cycle");

        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || engine.run_cycle());

        let result = match time::timeout(self.cycle_timeout, task).await {
            Ok(Ok(Ok(report))) => Ok(report),
            Ok(Ok(Err(e))) => Err(CycleFailure::Failed(e)),
            Ok(Err(join_err)) => Err(CycleFailure::Panicked(join_err.to_string())),
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::SeqCst);
                // The blocking task keeps running; the engine's guard rejects
                // new cycles until it finishes.
                Err(CycleFailure::TimedOut(self.cycle_timeout))
            }
        };

        match &result {
            Ok(report) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                if report.commit_sha.is_some() {
                    self.stats.total_commits.fetch_add(1, Ordering::SeqCst);
                }
                info!(
                    cycle = cycle_num,
                    written = report.files_written,
                    removed = report.files_removed,
                    pushed = report.pushed,
                    "backup cycle completed successfully"
                );
            }
            Err(CycleFailure::Failed(SyncError::AlreadyRunning { started_at })) => {
                warn!(
                    cycle = cycle_num,
                    started_at = %started_at,
                    "skipping backup cycle: previous cycle still running"
                );
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    cycle = cycle_num,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "backup cycle failed"
                );
            }
        }

        result
    }
}
