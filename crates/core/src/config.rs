//! TOML-based configuration system for kubesnap.
//!
//! Secrets (access token, SSH key passphrase) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::sanitizer::{rules, StripPath};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduling / working directory settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Remote repository, branch, identity and authentication.
    #[serde(default)]
    pub git: GitConfig,

    /// Kind / namespace selection.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Declarative field stripping.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// Where raw resource listings come from.
    #[serde(default)]
    pub source: SourceConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between backup cycles (default 3600, minimum 60).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Deadline for one whole cycle, in seconds (default 600).
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Local working tree (or dump directory in dump-only mode).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Write the snapshot tree locally without any git operation.
    #[serde(default)]
    pub dump_only: bool,
}

fn default_interval() -> u64 {
    3600
}
fn default_cycle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/kube-backup")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            cycle_timeout_secs: default_cycle_timeout(),
            log_level: default_log_level(),
            work_dir: default_work_dir(),
            dump_only: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// How the daemon authenticates against the remote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// SSH private key.
    Ssh,
    /// HTTP basic auth with an access token as password.
    Token,
}

impl AuthMethod {
    /// `https://` remotes use a token, everything else SSH.
    pub fn detect(remote_url: &str) -> Self {
        if remote_url.starts_with("https://") {
            Self::Token
        } else {
            Self::Ssh
        }
    }
}

/// Remote repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Remote URL (`git@host:org/repo.git`, `https://...`, or a local path).
    #[serde(default)]
    pub remote_url: String,

    /// Branch receiving the snapshots.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Commit author name.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Commit author email.
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Explicit auth method; detected from `remote_url` when absent.
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,

    /// Private key for SSH remotes.
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,

    /// Environment variable holding the SSH key passphrase.
    #[serde(default)]
    pub ssh_passphrase_env: Option<String>,

    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Preferred known_hosts file for SSH host key verification.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,

    /// Resolved SSH passphrase (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub ssh_passphrase: Option<String>,
}

fn default_branch() -> String {
    "main".into()
}
fn default_author_name() -> String {
    "Kube Git Backup".into()
}
fn default_author_email() -> String {
    "kube-backup@example.com".into()
}
fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("~/.ssh/id_rsa")
}
fn default_token_env() -> String {
    "GIT_TOKEN".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            branch: default_branch(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            auth_method: None,
            ssh_key_path: default_ssh_key_path(),
            ssh_passphrase_env: None,
            token_env: default_token_env(),
            known_hosts_path: None,
            token: None,
            ssh_passphrase: None,
        }
    }
}

impl GitConfig {
    /// The configured auth method, or the one implied by the remote URL.
    pub fn effective_auth_method(&self) -> AuthMethod {
        self.auth_method
            .unwrap_or_else(|| AuthMethod::detect(&self.remote_url))
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Kind and namespace selection lists. Entries may be glob patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Kinds to back up (empty = all).
    #[serde(default = "default_include_kinds")]
    pub include_kinds: Vec<String>,

    /// Kinds never backed up; wins over `include_kinds`.
    #[serde(default = "default_exclude_kinds")]
    pub exclude_kinds: Vec<String>,

    /// Namespaces to back up (empty = all).
    #[serde(default)]
    pub include_namespaces: Vec<String>,

    /// Namespaces never backed up; wins over `include_namespaces`.
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,

    /// Skip objects the cluster recreates on its own (root CA ConfigMaps,
    /// service-account token Secrets, release Secrets).
    #[serde(default = "default_true")]
    pub skip_system_objects: bool,
}

fn default_include_kinds() -> Vec<String> {
    [
        "Deployment",
        "DaemonSet",
        "StatefulSet",
        "Service",
        "ConfigMap",
        "Secret",
        "Ingress",
        "Namespace",
        "Role",
        "RoleBinding",
        "ClusterRole",
        "ClusterRoleBinding",
        "ServiceAccount",
        "PersistentVolume",
        "PersistentVolumeClaim",
        "StorageClass",
        "NetworkPolicy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_exclude_kinds() -> Vec<String> {
    ["Pod", "Event", "Endpoints", "ReplicaSet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_exclude_namespaces() -> Vec<String> {
    vec!["kube-system".into(), "kube-node-lease".into()]
}
fn default_true() -> bool {
    true
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            include_kinds: default_include_kinds(),
            exclude_kinds: default_exclude_kinds(),
            include_namespaces: Vec::new(),
            exclude_namespaces: default_exclude_namespaces(),
            skip_system_objects: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Sanitizer
// ---------------------------------------------------------------------------

/// Declarative strip-path list, applied top to bottom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    #[serde(default = "rules::default_strip_paths")]
    pub strip_paths: Vec<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            strip_paths: rules::default_strip_paths(),
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Resource listing source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory of `*.json` / `*.yaml` listings, one per kind.
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("/var/lib/kubesnap/listings")
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.expand_paths();

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from environment variables.
    ///
    /// Missing variables log a warning; [`validate`](Self::validate) decides
    /// whether the missing value is required.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.git.token = resolve_optional_env(&self.git.token_env, "git.token_env");

        if let Some(ref env_name) = self.git.ssh_passphrase_env {
            self.git.ssh_passphrase = resolve_optional_env(env_name, "git.ssh_passphrase_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.interval_secs < 60 {
            return Err(invalid(
                "daemon.interval_secs",
                "backup interval must be at least 60 seconds",
            ));
        }
        if self.daemon.cycle_timeout_secs == 0 {
            return Err(invalid("daemon.cycle_timeout_secs", "cycle timeout must be > 0"));
        }
        if self.daemon.work_dir.as_os_str().is_empty() {
            return Err(invalid("daemon.work_dir", "working directory must not be empty"));
        }

        if !self.daemon.dump_only {
            self.validate_git()?;
        }

        for (field, list) in [
            ("selection.include_kinds", &self.selection.include_kinds),
            ("selection.exclude_kinds", &self.selection.exclude_kinds),
            ("selection.include_namespaces", &self.selection.include_namespaces),
            ("selection.exclude_namespaces", &self.selection.exclude_namespaces),
        ] {
            if list.iter().any(|entry| entry.trim().is_empty()) {
                return Err(invalid(field, "entries must not be empty"));
            }
        }

        for raw in &self.sanitizer.strip_paths {
            StripPath::parse(raw).map_err(|e| {
                invalid("sanitizer.strip_paths", &format!("'{raw}': {e}"))
            })?;
        }

        Ok(())
    }

    fn validate_git(&self) -> Result<(), ConfigError> {
        if self.git.remote_url.trim().is_empty() {
            return Err(invalid("git.remote_url", "remote URL must not be empty"));
        }
        if self.git.branch.trim().is_empty() {
            return Err(invalid("git.branch", "branch must not be empty"));
        }
        if git2::Branch::name_is_valid(&self.git.branch).ok() != Some(true) {
            return Err(invalid("git.branch", "not a valid branch name"));
        }
        if self.git.author_name.trim().is_empty() || self.git.author_email.trim().is_empty() {
            return Err(invalid("git.author_name", "author identity must not be empty"));
        }
        match self.git.effective_auth_method() {
            AuthMethod::Token if self.git.token.is_none() => Err(invalid(
                "git.token_env",
                &format!(
                    "token authentication requires ${} to be set",
                    self.git.token_env
                ),
            )),
            AuthMethod::Ssh if self.git.ssh_key_path.as_os_str().is_empty() => Err(invalid(
                "git.ssh_key_path",
                "SSH authentication requires a key path",
            )),
            _ => Ok(()),
        }
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.daemon.work_dir = expand_tilde(&self.daemon.work_dir);
        self.git.ssh_key_path = expand_tilde(&self.git.ssh_key_path);
        self.git.known_hosts_path = self.git.known_hosts_path.as_deref().map(expand_tilde);
        self.source.manifest_dir = expand_tilde(&self.source.manifest_dir);
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    match s.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        None => path.to_path_buf(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
