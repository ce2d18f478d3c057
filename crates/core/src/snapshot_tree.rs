//! The on-disk snapshot file tree.
//!
//! Layout:
//!
//! ```text
//! cluster-scoped/<lower-kind>/<name>.yaml
//! namespaces/<namespace>/<lower-kind>/<name>.yaml
//! ```
//!
//! The tree knows nothing about git; the repository synchronizer and the
//! dump-only target both drive it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::RepositoryError;
use crate::models::{SanitizedRecord, SNAPSHOT_EXTENSION};

/// Counts from [`SnapshotTree::materialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub written: usize,
    pub unchanged: usize,
    pub duplicates: usize,
}

/// A directory holding one snapshot file per record.
#[derive(Debug, Clone)]
pub struct SnapshotTree {
    root: PathBuf,
}

impl SnapshotTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths of every snapshot file currently in the tree, sorted.
    /// The `.git` directory is never entered.
    pub fn snapshot_files(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                RepositoryError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(rel.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Delete every snapshot file whose relative path is not in `keep`, then
    /// prune directories left empty. Returns the removed relative paths.
    pub fn reconcile(&self, keep: &HashSet<PathBuf>) -> Result<Vec<PathBuf>, RepositoryError> {
        let mut removed = Vec::new();
        for rel in self.snapshot_files()? {
            if keep.contains(&rel) {
                continue;
            }
            let path = self.root.join(&rel);
            std::fs::remove_file(&path).map_err(|e| RepositoryError::io(&path, e))?;
            debug!(path = %rel.display(), "removed stale snapshot");
            self.prune_empty_parents(&path);
            removed.push(rel);
        }
        Ok(removed)
    }

    /// Write each record to its path. Files whose bytes already match are
    /// left untouched. When two records map to the same path the first one
    /// wins.
    pub fn materialize(&self, records: &[SanitizedRecord]) -> Result<MaterializeStats, RepositoryError> {
        let mut stats = MaterializeStats::default();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            let rel = record.relative_path();
            if !seen.insert(rel.clone()) {
                warn!(resource = %record.id, path = %rel.display(), "duplicate snapshot path, dropping record");
                stats.duplicates += 1;
                continue;
            }

            let path = self.root.join(&rel);
            if std::fs::read(&path).is_ok_and(|existing| existing == record.yaml) {
                stats.unchanged += 1;
                continue;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RepositoryError::io(parent, e))?;
            }
            std::fs::write(&path, &record.yaml).map_err(|e| RepositoryError::io(&path, e))?;
            stats.written += 1;
        }

        debug!(
            written = stats.written,
            unchanged = stats.unchanged,
            duplicates = stats.duplicates,
            "materialized snapshot tree"
        );
        Ok(stats)
    }

    /// Reconcile and materialize in one pass. Returns (stats, removed paths).
    pub fn apply(
        &self,
        records: &[SanitizedRecord],
    ) -> Result<(MaterializeStats, Vec<PathBuf>), RepositoryError> {
        let keep = current_path_set(records);
        let removed = self.reconcile(&keep)?;
        let stats = self.materialize(records)?;
        Ok((stats, removed))
    }

    fn prune_empty_parents(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// The set of relative paths this cycle's records map to.
pub fn current_path_set(records: &[SanitizedRecord]) -> HashSet<PathBuf> {
    records.iter().map(SanitizedRecord::relative_path).collect()
}
