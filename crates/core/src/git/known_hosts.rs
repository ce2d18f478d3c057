//! SSH host key verification.
//!
//! Resolution order for trusted keys: an existing known_hosts file (strict:
//! unknown hosts are rejected), else a built-in set of public keys for common
//! Git providers (hosts outside the set are accepted with a warning).

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info, warn};

/// Public host keys of common Git providers, in known_hosts format.
const BUILTIN_HOST_KEYS: &[&str] = &[
    "github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl",
    "github.com ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBEmKSENjQEezOmxkZMy7opKgwFB9nkt5YRrYMjNuG5N87uRgg6CLrbo5wAdT/y6v0mKV0U2w0WZ2YB/++Tpockg=",
    "github.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQCj7ndNxQowgcQnjshcLrqPEiiphnt+VTTvDP6mHBL9j1aNUkY4Ue1gvwnGLVlOhGeYrnZaMgRK6+PKCUXaDbC7qtbW8gIkhL7aGCsOr/C56SJMy/BCZfxd1nWzAOxSDPgVsmerOBYfNqltV9/hWCqBywINIR+5dIg6JTJ72pcEpEjcYgXkE2YEFXV1JHnsKgbLWNlhScqb2UmyRkQyytRLtL+38TGxkxCflmO+5Z8CSSNY7GidjMIZ7Q4zMjA2n1nGrlTDkzwDCsw+wqFPGQA179cnfGWOWRVruj16z6XyvxvjJwbz0wQZ75XK5tKSb7FNyeIEs4TT4jk+S4dhPeAUC5y+bDYirYgM4GC7uEnztnZyaVWQ7B381AK4Qdrwt51ZqExKbQpTUNn+EjqoTwvqNj4kqx5QUCI0ThS/YkOxJCXmPUWZbhjpCg56i+2aB6CmK2JGhn57K5mj0MNdBXA4/WnwH6XoPWJzK5Nyu2zB3nAZp+S5hpQs+p1vN1/wsjk=",
    "gitlab.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf",
    "gitlab.com ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBFSMqzJeV9rUzU4kWitGjeR4PWSa29SPqJ1fVkhtj3Hw9xjLVXVYrU9QlYWrOLXBpQ6KWjbjTDTdDkoohFzgbEY=",
    "gitlab.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQCsj2bNKTBSpIYDEGk9KxsGh3mySTRgMtXL583qmBpzeQ+jqCMRgBqB98u3z++J1sKlXHWfM9dyhSevkMwSbhoR8XIq/U0tCNyokEi/ueaBMCvbcTHhO7FcwzY92WK4Yt0aGROY5qX2UKSeOvuP4D6TPqKF1onrSzH9bx9XUf2lEdWT/ia1NEKjunUqu1xOB/StKDHMoX4/OKyIzuS0q/T1zOATthvasJFoPrAjkohTyaDUz2LN5JoH839hViyEG82yB+MjcFV5MU3N1l1QL3cVUCh93xSaua1N85qivl+siMkPGbO5xR/En4iEY6K2XPASUEMaieWVNTRCtJ4S8H+9",
    "bitbucket.org ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIazEu89wgQZ4bqs3d63QSMzYVa0MuJ2e2gKTKqu+UUO",
    "bitbucket.org ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBPIQmuzMBuKdWeF4+a2sjSSpBK0iqitSQ+5BM9KhpexuGt20JpTVM7u5BDZngncgrqDMbWdxMWWOGtZ9UgbqgZE=",
    "bitbucket.org ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQDQeJzhupRu0u0cdegZIa8e86EG2qOCsIsD1Xw0xSeiPDlCr7kq97NLmMbpKTX6Esc30NuoqEEHCuc7yWtwp8dI76EEEB1VqY9QJq6vk+aySyboD5QF61I/1WeTwu+deCbgKMGbUijeXhtfbxSxm6JwGrXrhBdofTsbKRUsrN1WoNgUa8uqN1Vx6WAJw1JHPhglEGGHea6QICwJOAr/6mrui/oB7pkaWKHj3z7d1IC4KWLtY47elvjbaTlkN04Kc/5LFEirorGYVbt15kAUlqGM65pk6ZBxtaO3+30LVlORZkxOh+LKL/BvbZ/iRNhItLqNyieoQj/uh/7Iv4uyH/cV/0b4WDSd3DptigWq84lJubb9t/DnZlrJazxyDCulTmKdOR7vs9gMTo+uoIrPSb8ScTtvw65+odKAlBj59dhnVp9zd7QUojOpXlL62Aw56U4oO+FALuevvMjiWeavKhJqlR7i5n9srYcrNV7ttmDw7kf/97P5zauIhxcjX+xHv4M=",
];

/// One parsed known_hosts line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyEntry {
    pub patterns: Vec<String>,
    pub key_type: String,
    pub key: Vec<u8>,
}

impl HostKeyEntry {
    fn matches_host(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| {
            let p = strip_port(p);
            if p.contains(['*', '?']) {
                glob_match::glob_match(p, host)
            } else {
                p.eq_ignore_ascii_case(host)
            }
        })
    }
}

/// `[host]:port` -> `host`.
fn strip_port(pattern: &str) -> &str {
    pattern
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(host, _)| host)
        .unwrap_or(pattern)
}

/// Key type name embedded at the start of an SSH wire-format key blob.
fn wire_key_type(key: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = key.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}

/// Result of checking a presented host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Match,
    Mismatch,
    Unknown,
}

/// A set of trusted host keys.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<HostKeyEntry>,
}

impl KnownHosts {
    /// Parse known_hosts content. Hashed hosts, markers, negated patterns and
    /// undecodable keys are skipped.
    pub fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(hosts), Some(key_type), Some(encoded)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if hosts.starts_with("|1|") {
                debug!("skipping hashed known_hosts entry");
                continue;
            }
            let Ok(key) = STANDARD.decode(encoded) else {
                warn!(hosts, "skipping known_hosts entry with undecodable key");
                continue;
            };
            let patterns: Vec<String> = hosts
                .split(',')
                .filter(|p| !p.is_empty() && !p.starts_with('!'))
                .map(str::to_string)
                .collect();
            if patterns.is_empty() {
                continue;
            }
            entries.push(HostKeyEntry {
                patterns,
                key_type: key_type.to_string(),
                key,
            });
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Keys for common providers.
    pub fn builtin() -> Self {
        Self::parse(&BUILTIN_HOST_KEYS.join("\n"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn knows_host(&self, host: &str) -> bool {
        self.entries.iter().any(|e| e.matches_host(host))
    }

    /// Compare a raw host key (SSH wire format) against the entries for
    /// `host` of the same key type. A host listed only under other key types
    /// is `Unknown`.
    pub fn verify(&self, host: &str, key: &[u8]) -> HostKeyVerdict {
        let key_type = wire_key_type(key);
        let mut seen = false;
        for entry in self
            .entries
            .iter()
            .filter(|e| e.matches_host(host))
            .filter(|e| key_type.map_or(true, |t| t == e.key_type))
        {
            seen = true;
            if entry.key == key {
                return HostKeyVerdict::Match;
            }
        }
        if seen {
            HostKeyVerdict::Mismatch
        } else {
            HostKeyVerdict::Unknown
        }
    }
}

/// Where trusted keys came from, and how unknown hosts are treated.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Keys from a known_hosts file; unknown hosts are rejected.
    Strict { source: PathBuf, hosts: KnownHosts },
    /// Built-in provider keys; unknown hosts are accepted with a warning.
    Builtin { hosts: KnownHosts },
}

impl HostKeyPolicy {
    /// Probe the usual known_hosts locations, preferring `preferred`.
    pub fn resolve(preferred: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = preferred {
            candidates.push(p.to_path_buf());
        }
        if let Some(p) = std::env::var_os("SSH_KNOWN_HOSTS").filter(|v| !v.is_empty()) {
            candidates.push(PathBuf::from(p));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".ssh").join("known_hosts"));
        }
        candidates.push(PathBuf::from("/etc/ssh/ssh_known_hosts"));
        Self::from_candidates(&candidates)
    }

    /// Use the first candidate file that exists and holds at least one key.
    pub fn from_candidates(candidates: &[PathBuf]) -> Self {
        for path in candidates {
            if !path.is_file() {
                continue;
            }
            match KnownHosts::load(path) {
                Ok(hosts) if !hosts.is_empty() => {
                    info!(path = %path.display(), entries = hosts.len(), "using known_hosts file");
                    return Self::Strict {
                        source: path.clone(),
                        hosts,
                    };
                }
                Ok(_) => debug!(path = %path.display(), "known_hosts file has no usable entries"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read known_hosts file"),
            }
        }
        warn!("no known_hosts file available, falling back to built-in provider host keys");
        Self::Builtin {
            hosts: KnownHosts::builtin(),
        }
    }

    /// Decide whether to trust `key` for `host`.
    pub fn accepts(&self, host: &str, key: &[u8]) -> bool {
        match self {
            Self::Strict { source, hosts } => match hosts.verify(host, key) {
                HostKeyVerdict::Match => true,
                HostKeyVerdict::Mismatch => {
                    warn!(host, source = %source.display(), "SSH host key does not match known_hosts");
                    false
                }
                HostKeyVerdict::Unknown => {
                    warn!(host, source = %source.display(), "no known_hosts entry for this host and key type");
                    false
                }
            },
            Self::Builtin { hosts } => match hosts.verify(host, key) {
                HostKeyVerdict::Match => true,
                HostKeyVerdict::Mismatch => {
                    warn!(host, "SSH host key does not match the built-in key for this provider");
                    false
                }
                HostKeyVerdict::Unknown => {
                    warn!(host, "accepting SSH host key WITHOUT verification");
                    true
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf";
    const ECDSA_KEY: &str = "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBEmKSENjQEezOmxkZMy7opKgwFB9nkt5YRrYMjNuG5N87uRgg6CLrbo5wAdT/y6v0mKV0U2w0WZ2YB/++Tpockg=";

    fn raw(encoded: &str) -> Vec<u8> {
        STANDARD.decode(encoded).unwrap()
    }

    #[test]
    fn test_parse_skips_unusable_lines() {
        let content = format!(
            "# comment\n\
             \n\
             git.example.com,10.0.0.5 ssh-ed25519 {KEY_A}\n\
             |1|abc=|def= ssh-ed25519 {KEY_A}\n\
             @cert-authority *.example.com ssh-ed25519 {KEY_A}\n\
             broken-line\n\
             bad.example.com ssh-ed25519 !!!notbase64!!!\n"
        );
        let hosts = KnownHosts::parse(&content);
        assert_eq!(hosts.len(), 1);
        assert!(hosts.knows_host("git.example.com"));
        assert!(hosts.knows_host("10.0.0.5"));
        assert!(!hosts.knows_host("bad.example.com"));
    }

    #[test]
    fn test_verify() {
        let hosts = KnownHosts::parse(&format!("[git.example.com]:2222 ssh-ed25519 {KEY_A}\n"));
        assert_eq!(hosts.verify("git.example.com", &raw(KEY_A)), HostKeyVerdict::Match);
        assert_eq!(
            hosts.verify("git.example.com", &raw(KEY_B)),
            HostKeyVerdict::Mismatch
        );
        assert_eq!(hosts.verify("other.host", &raw(KEY_A)), HostKeyVerdict::Unknown);
    }

    #[test]
    fn test_verify_only_compares_same_key_type() {
        let hosts = KnownHosts::parse(&format!("git.example.com ssh-ed25519 {KEY_A}\n"));
        assert_eq!(wire_key_type(&raw(ECDSA_KEY)), Some("ecdsa-sha2-nistp256"));
        assert_eq!(
            hosts.verify("git.example.com", &raw(ECDSA_KEY)),
            HostKeyVerdict::Unknown
        );
        assert_eq!(wire_key_type(b"\xff\xff"), None);
    }

    #[test]
    fn test_strict_rejects_unlisted_key_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("git.example.com ssh-ed25519 {KEY_A}\n")).unwrap();
        let policy = HostKeyPolicy::from_candidates(&[path]);
        assert!(policy.accepts("git.example.com", &raw(KEY_A)));
        assert!(!policy.accepts("git.example.com", &raw(ECDSA_KEY)));
    }

    #[test]
    fn test_builtin_accepts_every_published_provider_key() {
        let policy = HostKeyPolicy::Builtin {
            hosts: KnownHosts::builtin(),
        };
        for line in BUILTIN_HOST_KEYS {
            let mut fields = line.split_whitespace();
            let host = fields.next().unwrap();
            let key_type = fields.next().unwrap();
            let key = raw(fields.next().unwrap());
            assert_eq!(wire_key_type(&key), Some(key_type), "{host} {key_type}");
            assert!(policy.accepts(host, &key), "{host} {key_type} rejected");
        }
        // github's ecdsa key presented for gitlab is a same-type mismatch.
        assert!(!policy.accepts("gitlab.com", &raw(ECDSA_KEY)));
    }

    #[test]
    fn test_wildcard_patterns() {
        let hosts = KnownHosts::parse(&format!("*.corp.example ssh-ed25519 {KEY_A}\n"));
        assert!(hosts.knows_host("git.corp.example"));
        assert!(!hosts.knows_host("corp.example.org"));
    }

    #[test]
    fn test_builtin_covers_common_providers() {
        let hosts = KnownHosts::builtin();
        assert!(hosts.knows_host("github.com"));
        assert!(hosts.knows_host("gitlab.com"));
        assert!(hosts.knows_host("bitbucket.org"));
        assert_eq!(hosts.verify("github.com", &raw(KEY_A)), HostKeyVerdict::Match);
    }

    #[test]
    fn test_policy_prefers_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let empty = dir.path().join("empty");
        std::fs::write(&empty, "# nothing here\n").unwrap();
        let real = dir.path().join("known_hosts");
        std::fs::write(&real, format!("git.internal ssh-ed25519 {KEY_B}\n")).unwrap();

        let policy = HostKeyPolicy::from_candidates(&[missing, empty, real.clone()]);
        match &policy {
            HostKeyPolicy::Strict { source, .. } => assert_eq!(source, &real),
            other => panic!("expected strict policy, got {other:?}"),
        }
        assert!(policy.accepts("git.internal", &raw(KEY_B)));
        assert!(!policy.accepts("git.internal", &raw(KEY_A)));
        assert!(!policy.accepts("unknown.host", &raw(KEY_A)));
    }

    #[test]
    fn test_policy_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let policy = HostKeyPolicy::from_candidates(&[dir.path().join("nope")]);
        assert!(matches!(policy, HostKeyPolicy::Builtin { .. }));
        assert!(policy.accepts("github.com", &raw(KEY_A)));
        assert!(!policy.accepts("github.com", &raw(KEY_B)));
        // Last resort: unknown hosts pass with a warning.
        assert!(policy.accepts("git.selfhosted.example", &raw(KEY_B)));
    }
}
