//! Deterministic, cluster-agnostic serialization of resource records.
//!
//! Every record passes through the same fixed pipeline:
//!
//! 1. metadata scrub (server-assigned fields, ephemeral annotations/labels)
//! 2. kind-specific spec scrub ([`rules::KIND_RULES`])
//! 3. status removal
//! 4. declarative strip paths (configurable, see [`path`])
//! 5. YAML encoding with sorted keys
//!
//! Later steps see the output of earlier ones. Sanitizing the same input
//! twice yields byte-identical output, which is what lets the repository
//! synchronizer detect "nothing changed".

pub mod path;
pub mod rules;

use std::collections::HashMap;

use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::SanitizerConfig;
use crate::errors::{ConfigError, SanitizeError};
use crate::models::{ResourceId, ResourceRecord, SanitizedRecord};

pub use path::{PathParseError, Segment, StripPath};

/// Outcome of sanitizing a batch: successes in input order plus the records
/// that were dropped.
#[derive(Debug, Default)]
pub struct SanitizeBatch {
    pub records: Vec<SanitizedRecord>,
    pub failures: Vec<(ResourceId, SanitizeError)>,
}

/// The field sanitizer.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    kind_rules: HashMap<String, Vec<StripPath>>,
    strip_paths: Vec<StripPath>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        let strip_paths = rules::DEFAULT_STRIP_PATHS
            .iter()
            .filter_map(|raw| StripPath::parse(raw).ok())
            .collect();
        Self::with_strip_paths(strip_paths)
    }
}

impl Sanitizer {
    /// Build a sanitizer with an explicit declarative strip list.
    pub fn with_strip_paths(strip_paths: Vec<StripPath>) -> Self {
        let kind_rules = rules::KIND_RULES
            .iter()
            .map(|(kind, paths)| {
                let parsed = paths
                    .iter()
                    .filter_map(|raw| StripPath::parse(raw).ok())
                    .collect();
                (kind.to_string(), parsed)
            })
            .collect();
        Self {
            kind_rules,
            strip_paths,
        }
    }

    /// Build a sanitizer from the `[sanitizer]` config section.
    pub fn from_config(config: &SanitizerConfig) -> Result<Self, ConfigError> {
        let strip_paths = config
            .strip_paths
            .iter()
            .map(|raw| {
                StripPath::parse(raw).map_err(|e| ConfigError::InvalidValue {
                    field: "sanitizer.strip_paths".into(),
                    detail: format!("'{raw}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = strip_paths.len(), "loaded strip paths");
        Ok(Self::with_strip_paths(strip_paths))
    }

    /// The declarative strip list, in application order.
    pub fn strip_paths(&self) -> &[StripPath] {
        &self.strip_paths
    }

    /// Sanitize one record.
    pub fn sanitize(&self, record: &ResourceRecord) -> Result<SanitizedRecord, SanitizeError> {
        let id = &record.id;
        id.validate_path_segments()?;

        if !record.object.is_object() {
            return Err(SanitizeError::NotAnObject {
                kind: id.kind.clone(),
                name: id.name.clone(),
                found: value_type(&record.object),
            });
        }

        let mut document = record.object.clone();
        self.sanitize_document(&id.kind, &mut document);

        let yaml = serde_yaml::to_string(&document).map_err(|e| SanitizeError::Serialize {
            kind: id.kind.clone(),
            name: id.name.clone(),
            message: e.to_string(),
        })?;

        Ok(SanitizedRecord {
            id: id.clone(),
            yaml: yaml.into_bytes(),
        })
    }

    /// Apply steps 1-4 of the pipeline in place.
    pub fn sanitize_document(&self, kind: &str, document: &mut Value) {
        let Some(root) = document.as_object_mut() else {
            return;
        };

        scrub_metadata(root);

        if let Some(paths) = self.kind_rules.get(kind) {
            for path in paths {
                path.apply(document);
            }
        }

        if let Some(root) = document.as_object_mut() {
            root.remove("status");
        }

        for path in &self.strip_paths {
            path.apply(document);
        }
    }

    /// Sanitize a batch in parallel. Failed records are logged and dropped;
    /// the rest keep their input order.
    pub fn sanitize_batch(&self, records: &[ResourceRecord]) -> SanitizeBatch {
        let results: Vec<_> = records
            .par_iter()
            .map(|record| (record, self.sanitize(record)))
            .collect();

        let mut batch = SanitizeBatch::default();
        for (record, result) in results {
            match result {
                Ok(sanitized) => batch.records.push(sanitized),
                Err(e) => {
                    warn!(resource = %record.id, error = %e, "dropping record that failed sanitization");
                    batch.failures.push((record.id.clone(), e));
                }
            }
        }
        batch
    }
}

fn scrub_metadata(root: &mut Map<String, Value>) {
    let Some(Value::Object(metadata)) = root.get_mut("metadata") else {
        return;
    };

    for field in rules::METADATA_FIELDS {
        metadata.remove(*field);
    }
    remove_keys_and_prune(metadata, "annotations", rules::EPHEMERAL_ANNOTATIONS);
    remove_keys_and_prune(metadata, "labels", rules::EPHEMERAL_LABELS);
}

/// Remove `keys` from the map at `container`; drop the container once empty.
fn remove_keys_and_prune(metadata: &mut Map<String, Value>, container: &str, keys: &[&str]) {
    let now_empty = match metadata.get_mut(container) {
        Some(Value::Object(map)) => {
            for key in keys {
                map.remove(*key);
            }
            map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        metadata.remove(container);
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
