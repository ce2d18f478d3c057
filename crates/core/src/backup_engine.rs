//! Backup cycle orchestration.
//!
//! The [`BackupEngine`] runs one cycle at a time:
//!
//! 1. Fetch raw records from the [`ResourceSource`].
//! 2. Drop records rejected by the [`Selection`].
//! 3. Sanitize the remainder in parallel, joining before any write.
//! 4. Hand the sanitized batch to the [`SnapshotTarget`].
//!
//! An unavailable source stops the cycle before step 4, so the existing
//! snapshot is never reconciled against an empty fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{error, info, info_span, warn};

use crate::config::AppConfig;
use crate::errors::{ConfigError, RepositoryError, SyncError};
use crate::git::GitAuth;
use crate::models::{CycleReport, SanitizedRecord};
use crate::repository::{RepoSettings, RepoState, RepositorySynchronizer, SyncOutcome};
use crate::sanitizer::Sanitizer;
use crate::selector::Selection;
use crate::snapshot_tree::SnapshotTree;
use crate::source::ResourceSource;

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where sanitized records end up.
pub enum SnapshotTarget {
    /// A git working tree that is committed and pushed every cycle.
    Repository(RepositorySynchronizer),
    /// A plain directory; no version control.
    Directory(SnapshotTree),
}

impl SnapshotTarget {
    /// Build the target described by `config`. Credentials are checked here
    /// so that bad auth settings fail at startup.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        if config.daemon.dump_only {
            return Ok(Self::Directory(SnapshotTree::new(&config.daemon.work_dir)));
        }
        let auth = GitAuth::from_config(&config.git)?;
        Ok(Self::Repository(RepositorySynchronizer::new(
            RepoSettings::from_config(config),
            auth,
        )))
    }

    /// Synchronizer state; `None` for a plain directory.
    pub fn repo_state(&self) -> Option<RepoState> {
        match self {
            Self::Repository(sync) => Some(sync.state()),
            Self::Directory(_) => None,
        }
    }

    pub fn initialize(&mut self) -> Result<(), RepositoryError> {
        match self {
            Self::Repository(sync) => sync.initialize(),
            Self::Directory(tree) => std::fs::create_dir_all(tree.root())
                .map_err(|e| RepositoryError::io(tree.root(), e)),
        }
    }

    fn write(&mut self, records: &[SanitizedRecord]) -> Result<SyncOutcome, RepositoryError> {
        match self {
            Self::Repository(sync) => sync.sync(records),
            Self::Directory(tree) => {
                let (stats, removed) = tree.apply(records)?;
                Ok(SyncOutcome {
                    files_written: stats.written,
                    files_unchanged: stats.unchanged,
                    files_removed: removed.len(),
                    duplicates: stats.duplicates,
                    ..SyncOutcome::default()
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BackupEngine {
    source: Box<dyn ResourceSource>,
    selection: Selection,
    sanitizer: Sanitizer,
    target: Mutex<SnapshotTarget>,
    /// Atomic flag preventing overlapping cycles.
    running: Arc<AtomicBool>,
    cycle_started_at: Mutex<Option<String>>,
}

impl BackupEngine {
    pub fn new(
        source: Box<dyn ResourceSource>,
        selection: Selection,
        sanitizer: Sanitizer,
        target: SnapshotTarget,
    ) -> Self {
        info!(source = %source.describe(), "initializing backup engine");
        Self {
            source,
            selection,
            sanitizer,
            target: Mutex::new(target),
            running: Arc::new(AtomicBool::new(false)),
            cycle_started_at: Mutex::new(None),
        }
    }

    /// Wire an engine from a validated config.
    pub fn from_config(config: &AppConfig, source: Box<dyn ResourceSource>) -> Result<Self, ConfigError> {
        let selection = Selection::new(&config.selection);
        let sanitizer = Sanitizer::from_config(&config.sanitizer)?;
        let target = SnapshotTarget::from_config(config)?;
        info!(
            source = %source.describe(),
            strip_paths = sanitizer.strip_paths().len(),
            dump_only = config.daemon.dump_only,
            "backup engine configured"
        );
        Ok(Self::new(source, selection, sanitizer, target))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn repo_state(&self) -> Option<RepoState> {
        self.lock_target().repo_state()
    }

    /// Prepare the target ahead of the first cycle.
    pub fn initialize(&self) -> Result<(), RepositoryError> {
        self.lock_target().initialize()
    }

    fn lock_target(&self) -> std::sync::MutexGuard<'_, SnapshotTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute one backup cycle. Blocking.
    pub fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .cycle_started_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default();
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = CycleGuard(self.running.clone());

        let mut report = CycleReport {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now().to_rfc3339(),
            ..Default::default()
        };
        *self
            .cycle_started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.started_at.clone());

        let span = info_span!("cycle", id = %report.cycle_id);
        let _enter = span.enter();
        info!("backup cycle started");

        match self.do_cycle(&mut report) {
            Ok(()) => {
                report.completed_at = Some(Utc::now().to_rfc3339());
                if report.is_partial() {
                    warn!(
                        source_failures = report.source_failures,
                        sanitize_failures = report.sanitize_failures,
                        "backup cycle completed with skipped resources"
                    );
                }
                info!(
                    fetched = report.fetched,
                    selected = report.selected,
                    sanitized = report.sanitized,
                    written = report.files_written,
                    removed = report.files_removed,
                    commit = report.commit_sha.as_deref().unwrap_or("-"),
                    "backup cycle completed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "backup cycle failed");
                Err(e)
            }
        }
    }

    fn do_cycle(&self, report: &mut CycleReport) -> Result<(), SyncError> {
        let fetched = self.source.fetch()?;
        report.fetched = fetched.records.len();
        report.source_failures = fetched.failures.len();

        let selected = self.selection.filter(fetched.records);
        report.selected = selected.len();

        let batch = self.sanitizer.sanitize_batch(&selected);
        report.sanitized = batch.records.len();
        report.sanitize_failures = batch.failures.len();

        let outcome = self.lock_target().write(&batch.records)?;
        report.files_written = outcome.files_written;
        report.files_removed = outcome.files_removed;
        report.commit_sha = outcome.commit_sha;
        report.pushed = outcome.pushed;
        Ok(())
    }
}

/// Drop guard that resets the `running` flag, even if a cycle panics.
struct CycleGuard(Arc<AtomicBool>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
