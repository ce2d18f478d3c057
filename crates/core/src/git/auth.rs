//! Remote credentials and host verification for `git2` transports.

use std::path::PathBuf;

use git2::{CertificateCheckStatus, Cred, CredentialType, ErrorClass, ErrorCode, RemoteCallbacks};
use tracing::{debug, warn};

use crate::config::{AuthMethod, GitConfig};
use crate::errors::ConfigError;

use super::known_hosts::HostKeyPolicy;

/// Username presented with an access token over HTTPS.
const TOKEN_USERNAME: &str = "token";

/// How to authenticate against the remote.
#[derive(Clone)]
pub enum GitAuth {
    Ssh {
        key_path: PathBuf,
        passphrase: Option<String>,
        host_keys: HostKeyPolicy,
    },
    Token {
        token: String,
    },
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh { key_path, .. } => f
                .debug_struct("Ssh")
                .field("key_path", key_path)
                .field("passphrase", &"<redacted>")
                .finish(),
            Self::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

impl GitAuth {
    /// Build credentials from resolved git settings.
    ///
    /// Secrets must already be resolved via
    /// [`AppConfig::resolve_env_vars`](crate::config::AppConfig::resolve_env_vars).
    pub fn from_config(git: &GitConfig) -> Result<Self, ConfigError> {
        match git.effective_auth_method() {
            AuthMethod::Token => {
                let token = git.token.clone().filter(|t| !t.is_empty()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        field: "git.token_env".into(),
                        detail: format!("environment variable '{}' is not set", git.token_env),
                    }
                })?;
                Ok(Self::Token { token })
            }
            AuthMethod::Ssh => {
                if !git.ssh_key_path.is_file() {
                    return Err(ConfigError::InvalidValue {
                        field: "git.ssh_key_path".into(),
                        detail: format!("SSH key '{}' does not exist", git.ssh_key_path.display()),
                    });
                }
                Ok(Self::Ssh {
                    key_path: git.ssh_key_path.clone(),
                    passphrase: git.ssh_passphrase.clone(),
                    host_keys: HostKeyPolicy::resolve(git.known_hosts_path.as_deref()),
                })
            }
        }
    }

    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Ssh { .. } => AuthMethod::Ssh,
            Self::Token { .. } => AuthMethod::Token,
        }
    }

    /// Callbacks for a single fetch, clone or push.
    ///
    /// Credentials are offered once per operation; a second request means the
    /// remote refused them and fails with an authentication error instead of
    /// looping.
    pub fn remote_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0u32;

        match self {
            Self::Token { token } => {
                callbacks.credentials(move |_url, _username, allowed| {
                    if !allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                        return Err(auth_error(ErrorClass::Http, "remote does not accept token credentials"));
                    }
                    attempts += 1;
                    if attempts > 1 {
                        return Err(auth_error(ErrorClass::Http, "access token rejected by remote"));
                    }
                    Cred::userpass_plaintext(TOKEN_USERNAME, token)
                });
            }
            Self::Ssh {
                key_path,
                passphrase,
                host_keys,
            } => {
                callbacks.credentials(move |_url, username, allowed| {
                    if allowed.contains(CredentialType::USERNAME) {
                        return Cred::username(username.unwrap_or("git"));
                    }
                    attempts += 1;
                    if attempts > 1 {
                        return Err(auth_error(ErrorClass::Ssh, "SSH key rejected by remote"));
                    }
                    debug!(key = %key_path.display(), "offering SSH key");
                    Cred::ssh_key(username.unwrap_or("git"), None, key_path, passphrase.as_deref())
                });
                callbacks.certificate_check(move |cert, host| {
                    let Some(hostkey) = cert.as_hostkey() else {
                        return Ok(CertificateCheckStatus::CertificatePassthrough);
                    };
                    let Some(raw) = hostkey.hostkey() else {
                        warn!(host, "transport did not expose the raw host key, skipping verification");
                        return Ok(CertificateCheckStatus::CertificateOk);
                    };
                    if host_keys.accepts(host, raw) {
                        Ok(CertificateCheckStatus::CertificateOk)
                    } else {
                        Err(git2::Error::new(
                            ErrorCode::Certificate,
                            ErrorClass::Ssh,
                            format!("host key verification failed for {host}"),
                        ))
                    }
                });
            }
        }

        callbacks
    }
}

fn auth_error(class: ErrorClass, message: &str) -> git2::Error {
    git2::Error::new(ErrorCode::Auth, class, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_config(url: &str) -> GitConfig {
        GitConfig {
            remote_url: url.into(),
            ..GitConfig::default()
        }
    }

    #[test]
    fn test_token_auth_from_config() {
        let mut git = git_config("https://github.com/acme/cluster-backup.git");
        git.token = Some("ghp_secret".into());
        let auth = GitAuth::from_config(&git).unwrap();
        assert_eq!(auth.method(), AuthMethod::Token);
        assert!(!format!("{auth:?}").contains("ghp_secret"));
    }

    #[test]
    fn test_token_auth_requires_token() {
        let git = git_config("https://github.com/acme/cluster-backup.git");
        let err = GitAuth::from_config(&git).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "git.token_env"));
    }

    #[test]
    fn test_ssh_auth_requires_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut git = git_config("git@github.com:acme/cluster-backup.git");
        git.ssh_key_path = dir.path().join("id_missing");
        assert!(GitAuth::from_config(&git).is_err());

        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "not a real key").unwrap();
        git.ssh_key_path = key;
        git.known_hosts_path = Some(dir.path().join("known_hosts"));
        let auth = GitAuth::from_config(&git).unwrap();
        assert_eq!(auth.method(), AuthMethod::Ssh);
    }

    #[test]
    fn test_auth_error_is_classified_as_authentication() {
        use crate::errors::RepoErrorKind;
        let err = auth_error(ErrorClass::Ssh, "nope");
        assert_eq!(RepoErrorKind::classify(&err), RepoErrorKind::Authentication);
    }
}
