//! Repository synchronizer: keeps one working tree on one branch in step
//! with the latest snapshot and pushes each change.
//!
//! State machine:
//!
//! ```text
//! Uninitialized --initialize--> Ready --sync--> Syncing --ok--> Ready
//!        ^                                         |
//!        |                                        err
//!        +------ (no working tree) ------ Faulted <+
//! ```
//!
//! A faulted synchronizer with an open working tree resumes from `Ready` on
//! the next sync; one that never opened a tree re-runs initialization.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::RepositoryError;
use crate::git::{BranchState, GitAuth, GitClient, PullOutcome};
use crate::models::SanitizedRecord;
use crate::snapshot_tree::SnapshotTree;

/// Externally visible synchronizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Uninitialized,
    Ready,
    Syncing,
    Faulted,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Syncing => write!(f, "syncing"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Where and as whom snapshots are committed.
#[derive(Debug, Clone)]
pub struct RepoSettings {
    pub remote_url: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    pub work_dir: PathBuf,
}

impl RepoSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            remote_url: config.git.remote_url.clone(),
            branch: config.git.branch.clone(),
            author_name: config.git.author_name.clone(),
            author_email: config.git.author_email.clone(),
            work_dir: config.daemon.work_dir.clone(),
        }
    }
}

/// What one sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub files_written: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub duplicates: usize,
    /// SHA of the new commit; `None` when nothing changed.
    pub commit_sha: Option<String>,
    pub pushed: bool,
}

/// The commit message for a snapshot taken now.
pub fn commit_message() -> String {
    format!(
        "Backup Kubernetes resources - {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

pub struct RepositorySynchronizer {
    settings: RepoSettings,
    auth: GitAuth,
    tree: SnapshotTree,
    client: Option<GitClient>,
    branch_state: Option<BranchState>,
    state: RepoState,
}

impl RepositorySynchronizer {
    pub fn new(settings: RepoSettings, auth: GitAuth) -> Self {
        let tree = SnapshotTree::new(&settings.work_dir);
        Self {
            settings,
            auth,
            tree,
            client: None,
            branch_state: None,
            state: RepoState::Uninitialized,
        }
    }

    pub fn state(&self) -> RepoState {
        self.state
    }

    pub fn settings(&self) -> &RepoSettings {
        &self.settings
    }

    /// How the branch was resolved at initialization.
    pub fn branch_state(&self) -> Option<BranchState> {
        self.branch_state
    }

    /// True while the branch has no commits.
    pub fn is_unborn(&self) -> bool {
        self.client.as_ref().is_some_and(GitClient::is_unborn)
    }

    pub fn head_sha(&self) -> Option<String> {
        self.client.as_ref().and_then(GitClient::head_sha)
    }

    pub fn work_dir(&self) -> &Path {
        &self.settings.work_dir
    }

    /// Open the working tree, or clone it, then resolve the branch.
    ///
    /// A no-op when a working tree is already open.
    pub fn initialize(&mut self) -> Result<(), RepositoryError> {
        if self.client.is_some() {
            return Ok(());
        }
        match self.open_or_clone() {
            Ok((client, branch_state)) => {
                info!(
                    path = %self.settings.work_dir.display(),
                    branch = %self.settings.branch,
                    ?branch_state,
                    "repository ready"
                );
                self.client = Some(client);
                self.branch_state = Some(branch_state);
                self.state = RepoState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "repository initialization failed");
                self.state = RepoState::Faulted;
                Err(e)
            }
        }
    }

    fn open_or_clone(&self) -> Result<(GitClient, BranchState), RepositoryError> {
        let work_dir = &self.settings.work_dir;
        let client = if work_dir.join(".git").exists() {
            let client = GitClient::open(work_dir)?;
            client.ensure_remote_url(&self.settings.remote_url)?;
            client
        } else {
            if let Some(parent) = work_dir.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RepositoryError::io(parent, e))?;
            }
            GitClient::clone_repo(&self.settings.remote_url, work_dir, &self.auth)?
        };
        let branch_state = client.checkout_branch(&self.settings.branch)?;
        Ok((client, branch_state))
    }

    /// Bring the branch in line with `records` and push the result.
    ///
    /// Any error leaves the synchronizer `Faulted`; the next call retries.
    pub fn sync(&mut self, records: &[SanitizedRecord]) -> Result<SyncOutcome, RepositoryError> {
        self.initialize()?;
        self.state = RepoState::Syncing;
        let result = self.sync_ready(records);
        self.state = match &result {
            Ok(_) => RepoState::Ready,
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "repository sync failed");
                RepoState::Faulted
            }
        };
        result
    }

    fn sync_ready(&self, records: &[SanitizedRecord]) -> Result<SyncOutcome, RepositoryError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| RepositoryError::NotARepository(self.settings.work_dir.display().to_string()))?;
        let branch = &self.settings.branch;

        match client.pull(branch, &self.auth)? {
            PullOutcome::NoUpstream => debug!("remote branch has no history yet"),
            PullOutcome::UpToDate => debug!("working tree up to date"),
            PullOutcome::FastForwarded => info!("pulled remote changes"),
        }

        let (stats, removed) = self.tree.apply(records)?;
        let mut outcome = SyncOutcome {
            files_written: stats.written,
            files_unchanged: stats.unchanged,
            files_removed: removed.len(),
            duplicates: stats.duplicates,
            ..SyncOutcome::default()
        };

        let changed = client.stage_all()?;
        if changed == 0 {
            // A commit from a cycle whose push failed is still waiting.
            if client.has_unpushed_commits(branch)? {
                info!("no changes to commit, pushing earlier commits");
                client.push(branch, &self.auth)?;
                outcome.pushed = true;
            } else {
                info!("no changes to commit");
            }
            return Ok(outcome);
        }

        let oid = client.commit(
            &commit_message(),
            &self.settings.author_name,
            &self.settings.author_email,
        )?;
        outcome.commit_sha = Some(oid.to_string());
        client.push(branch, &self.auth)?;
        outcome.pushed = true;

        info!(
            sha = %oid,
            changed,
            written = outcome.files_written,
            removed = outcome.files_removed,
            "snapshot committed and pushed"
        );
        Ok(outcome)
    }
}
