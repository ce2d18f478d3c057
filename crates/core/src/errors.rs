//! Error types for the kubesnap core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Source errors
// ---------------------------------------------------------------------------

/// Errors from the resource source collaborator.
///
/// A failure listing one kind (or reading one listing file) is recovered
/// locally; only a failure of the whole source aborts a cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source as a whole is unreachable.
    #[error("resource source unavailable at '{path}': {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Listing one resource kind failed.
    #[error("failed to list {kind}: {detail}")]
    ListFailed { kind: String, detail: String },

    /// A listing file could not be read.
    #[error("failed to read listing '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A listing file could not be parsed.
    #[error("failed to parse listing '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    /// An object in a listing lacks the fields needed to identify it.
    #[error("object #{index} in '{path}' is missing '{field}'")]
    MissingIdentity {
        path: PathBuf,
        index: usize,
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Sanitize errors
// ---------------------------------------------------------------------------

/// Errors raised while sanitizing a single record. The record is dropped
/// from the cycle; the batch continues.
#[derive(Debug, Error)]
pub enum SanitizeError {
    /// The raw payload is not a key-value document.
    #[error("{kind} '{name}': payload is not an object (found {found})")]
    NotAnObject {
        kind: String,
        name: String,
        found: &'static str,
    },

    /// An identity field cannot be used as a path component.
    #[error("invalid {field} '{value}': {detail}")]
    InvalidIdentity {
        field: &'static str,
        value: String,
        detail: &'static str,
    },

    /// YAML encoding failed.
    #[error("{kind} '{name}': YAML serialization failed: {message}")]
    Serialize {
        kind: String,
        name: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Closed classification of repository failures.
///
/// Transport errors are classified once, where they leave `git2`, so callers
/// branch on the kind instead of on error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    Authentication,
    Network,
    EmptyRemote,
    NonFastForward,
    NotFound,
    Io,
    Other,
}

impl fmt::Display for RepoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Network => write!(f, "network"),
            Self::EmptyRemote => write!(f, "empty_remote"),
            Self::NonFastForward => write!(f, "non_fast_forward"),
            Self::NotFound => write!(f, "not_found"),
            Self::Io => write!(f, "io"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl RepoErrorKind {
    /// Classify a `git2` error.
    pub fn classify(err: &git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        match err.code() {
            ErrorCode::Auth | ErrorCode::Certificate => return Self::Authentication,
            ErrorCode::NotFastForward => return Self::NonFastForward,
            ErrorCode::UnbornBranch => return Self::EmptyRemote,
            ErrorCode::NotFound => return Self::NotFound,
            _ => {}
        }

        match err.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Ssh => {
                Self::Network
            }
            ErrorClass::Os | ErrorClass::Filesystem => Self::Io,
            _ => Self::Other,
        }
    }
}

/// Errors from the working tree and its remote.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A `git2` operation failed.
    #[error("git {operation} failed ({kind}): {source}")]
    Git {
        operation: &'static str,
        kind: RepoErrorKind,
        #[source]
        source: git2::Error,
    },

    /// The remote rejected a pushed reference.
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// The remote branch has commits the local branch does not, and the two
    /// cannot be fast-forwarded.
    #[error("remote branch '{branch}' has diverged from local history")]
    Diverged { branch: String },

    /// The local path exists but is not a usable working tree.
    #[error("working tree at '{0}' is not a git repository")]
    NotARepository(String),

    /// Filesystem error inside the working tree.
    #[error("working tree I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RepositoryError {
    /// The classified kind of this failure.
    pub fn kind(&self) -> RepoErrorKind {
        match self {
            Self::Git { kind, .. } => *kind,
            Self::PushRejected { .. } | Self::Diverged { .. } => RepoErrorKind::NonFastForward,
            Self::NotARepository(_) => RepoErrorKind::NotFound,
            Self::Io { .. } => RepoErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attach an operation name to `git2` results.
pub(crate) trait GitResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T, RepositoryError>;
}

impl<T> GitResultExt<T> for Result<T, git2::Error> {
    fn during(self, operation: &'static str) -> Result<T, RepositoryError> {
        self.map_err(|source| RepositoryError::Git {
            operation,
            kind: RepoErrorKind::classify(&source),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Cycle errors
// ---------------------------------------------------------------------------

/// Errors that abort a whole backup cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another cycle is still running.
    #[error("backup cycle already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The resource source could not be read at all.
    #[error("cycle source error: {0}")]
    Source(#[from] SourceError),

    /// Synchronizing the snapshot tree failed.
    #[error("cycle repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
