//! Shared data models: resource identities, raw and sanitized records, and
//! per-cycle reports.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::SanitizeError;

/// Top-level directory for records without a namespace.
pub const CLUSTER_SCOPED_DIR: &str = "cluster-scoped";

/// Top-level directory for namespaced records.
pub const NAMESPACES_DIR: &str = "namespaces";

/// Extension of every snapshot file.
pub const SNAPSHOT_EXTENSION: &str = "yaml";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of a resource. An empty namespace means cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Path of this record's snapshot file, relative to the tree root.
    ///
    /// `cluster-scoped/{kind}/{name}.yaml` or
    /// `namespaces/{namespace}/{kind}/{name}.yaml`, kind lower-cased.
    pub fn relative_path(&self) -> PathBuf {
        let file_name = format!("{}.{}", self.name, SNAPSHOT_EXTENSION);
        let kind_dir = self.kind.to_lowercase();
        let mut path = PathBuf::new();
        if self.is_cluster_scoped() {
            path.push(CLUSTER_SCOPED_DIR);
        } else {
            path.push(NAMESPACES_DIR);
            path.push(&self.namespace);
        }
        path.push(kind_dir);
        path.push(file_name);
        path
    }

    /// Check that every identity segment is usable as a single path component.
    pub fn validate_path_segments(&self) -> Result<(), SanitizeError> {
        check_segment("kind", &self.kind)?;
        check_segment("name", &self.name)?;
        if !self.is_cluster_scoped() {
            check_segment("namespace", &self.namespace)?;
        }
        Ok(())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster_scoped() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), SanitizeError> {
    let detail = if value.is_empty() {
        "must not be empty"
    } else if value == "." || value == ".." {
        "reserved path component"
    } else if value.contains('/') || value.contains('\\') {
        "contains a path separator"
    } else if value.contains('\0') {
        "contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(SanitizeError::InvalidIdentity {
        field,
        value: value.to_string(),
        detail,
    })
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A raw resource as produced by a [`ResourceSource`](crate::source::ResourceSource).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub object: serde_json::Value,
}

impl ResourceRecord {
    pub fn new(id: ResourceId, object: serde_json::Value) -> Self {
        Self { id, object }
    }
}

/// A sanitized record: identity plus its canonical YAML bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedRecord {
    pub id: ResourceId,
    pub yaml: Vec<u8>,
}

impl SanitizedRecord {
    pub fn relative_path(&self) -> PathBuf {
        self.id.relative_path()
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Statistics from a single backup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub fetched: usize,
    pub selected: usize,
    pub sanitized: usize,
    pub source_failures: usize,
    pub sanitize_failures: usize,
    pub files_written: usize,
    pub files_removed: usize,
    pub commit_sha: Option<String>,
    pub pushed: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl CycleReport {
    /// `true` if any record or kind was skipped because of an error.
    pub fn is_partial(&self) -> bool {
        self.source_failures > 0 || self.sanitize_failures > 0
    }
}
