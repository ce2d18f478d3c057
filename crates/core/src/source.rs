//! Resource sources.
//!
//! A [`ResourceSource`] produces the raw records for one cycle. Failures of a
//! single listing are collected in [`FetchOutcome::failures`]; an `Err` from
//! [`ResourceSource::fetch`] means the source as a whole is unavailable and
//! the cycle must stop before touching the snapshot tree.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::SourceError;
use crate::models::{ResourceId, ResourceRecord};

/// Records and per-listing failures from one fetch.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<ResourceRecord>,
    pub failures: Vec<SourceError>,
}

/// Supplies the raw resource records for a cycle.
pub trait ResourceSource: Send + Sync {
    fn fetch(&self) -> Result<FetchOutcome, SourceError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Manifest directory
// ---------------------------------------------------------------------------

const LISTING_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Reads listing files (`kubectl get <kind> -A -o json` output, or single
/// manifests) from a directory. Each file is one listing.
#[derive(Debug, Clone)]
pub struct ManifestDirSource {
    dir: PathBuf,
}

impl ManifestDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn listing_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let unavailable = |source| SourceError::Unavailable {
            path: self.dir.clone(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(unavailable)? {
            let path = entry.map_err(unavailable)?.path();
            let is_listing = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| LISTING_EXTENSIONS.contains(&e));
            if is_listing && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ResourceSource for ManifestDirSource {
    fn fetch(&self) -> Result<FetchOutcome, SourceError> {
        let files = self.listing_files()?;
        debug!(dir = %self.dir.display(), files = files.len(), "reading listings");

        let mut outcome = FetchOutcome::default();
        for path in files {
            match read_listing(&path) {
                Ok(listing) => {
                    outcome.records.extend(listing.records);
                    for failure in listing.failures {
                        warn!(error = %failure, "skipping object");
                        outcome.failures.push(failure);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping listing");
                    outcome.failures.push(e);
                }
            }
        }

        info!(
            records = outcome.records.len(),
            failures = outcome.failures.len(),
            "fetched resources"
        );
        Ok(outcome)
    }

    fn describe(&self) -> String {
        format!("manifest directory {}", self.dir.display())
    }
}

fn read_listing(path: &Path) -> Result<FetchOutcome, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| SourceError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_failed = |message: String| SourceError::ParseFailed {
        path: path.to_path_buf(),
        message,
    };

    let documents: Vec<Value> = if path.extension().is_some_and(|e| e == "json") {
        vec![serde_json::from_str(&content).map_err(|e| parse_failed(e.to_string()))?]
    } else {
        let mut docs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = Value::deserialize(document).map_err(|e| parse_failed(e.to_string()))?;
            if !value.is_null() {
                docs.push(value);
            }
        }
        docs
    };

    let mut outcome = FetchOutcome::default();
    let mut index = 0usize;
    for document in documents {
        for object in expand_list(document) {
            match record_from_object(object, path, index) {
                Ok(record) => outcome.records.push(record),
                Err(e) => outcome.failures.push(e),
            }
            index += 1;
        }
    }
    Ok(outcome)
}

/// Flatten a `List` / `*List` object into its items, filling in `kind` and
/// `apiVersion` the items omit.
fn expand_list(document: Value) -> Vec<Value> {
    let list_kind = document
        .get("kind")
        .and_then(Value::as_str)
        .filter(|k| k.ends_with("List"))
        .map(str::to_string);
    let Some(list_kind) = list_kind else {
        return vec![document];
    };
    let Value::Object(mut list) = document else {
        return Vec::new();
    };
    let Some(Value::Array(items)) = list.remove("items") else {
        return Vec::new();
    };

    let item_kind = list_kind.strip_suffix("List").filter(|k| !k.is_empty());
    let api_version = list.get("apiVersion").cloned();
    items
        .into_iter()
        .map(|mut item| {
            if let Some(obj) = item.as_object_mut() {
                if let Some(kind) = item_kind {
                    obj.entry("kind").or_insert_with(|| Value::String(kind.to_string()));
                }
                if let Some(ref v) = api_version {
                    obj.entry("apiVersion").or_insert_with(|| v.clone());
                }
            }
            item
        })
        .collect()
}

fn record_from_object(object: Value, path: &Path, index: usize) -> Result<ResourceRecord, SourceError> {
    let missing = |field| SourceError::MissingIdentity {
        path: path.to_path_buf(),
        index,
        field,
    };
    let str_field = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

    let kind = str_field(object.get("kind")).ok_or_else(|| missing("kind"))?;
    let metadata = object.get("metadata");
    let name = str_field(metadata.and_then(|m| m.get("name"))).ok_or_else(|| missing("metadata.name"))?;
    let namespace = str_field(metadata.and_then(|m| m.get("namespace"))).unwrap_or_default();
    let api_version = str_field(object.get("apiVersion")).unwrap_or_default();

    Ok(ResourceRecord::new(
        ResourceId::new(api_version, kind, namespace, name),
        object,
    ))
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// A fixed, in-memory set of records.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<ResourceRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<ResourceRecord>) -> Self {
        Self { records }
    }
}

impl ResourceSource for StaticSource {
    fn fetch(&self) -> Result<FetchOutcome, SourceError> {
        Ok(FetchOutcome {
            records: self.records.clone(),
            failures: Vec::new(),
        })
    }

    fn describe(&self) -> String {
        format!("static source ({} records)", self.records.len())
    }
}
