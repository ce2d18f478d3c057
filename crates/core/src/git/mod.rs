//! Git operations for kubesnap.

pub mod auth;
pub mod client;
pub mod known_hosts;

pub use auth::GitAuth;
pub use client::{BranchState, GitClient, PullOutcome, REMOTE_NAME};
pub use known_hosts::{HostKeyPolicy, KnownHosts};
