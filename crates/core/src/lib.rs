//! kubesnap core library.
//!
//! This crate provides the backup pipeline that turns live cluster resources
//! into a version-controlled file tree: configuration, resource sources,
//! selection, field sanitization, the snapshot tree, the git repository
//! synchronizer, and the backup engine that drives one cycle.

pub mod backup_engine;
pub mod config;
pub mod errors;
pub mod git;
pub mod models;
pub mod repository;
pub mod sanitizer;
pub mod selector;
pub mod snapshot_tree;
pub mod source;

// Re-exports for convenience.
pub use backup_engine::{BackupEngine, SnapshotTarget};
pub use config::AppConfig;
pub use repository::{RepoState, RepositorySynchronizer};
pub use sanitizer::Sanitizer;
pub use selector::Selection;
pub use source::{ManifestDirSource, ResourceSource, StaticSource};
