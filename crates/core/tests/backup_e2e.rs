//! End-to-end tests for the backup pipeline against a real git remote.
//!
//! These tests exercise the real `BackupEngine` with:
//! - An in-memory resource source whose contents change between cycles
//! - A local bare repository as "origin"
//! - The repository synchronizer writing, committing and pushing
//!
//! No network I/O: remotes are plain filesystem paths.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::Repository;
use serde_json::{json, Value};
use tempfile::TempDir;

use kubesnap_core::backup_engine::{BackupEngine, SnapshotTarget};
use kubesnap_core::errors::SourceError;
use kubesnap_core::git::{GitAuth, GitClient};
use kubesnap_core::models::{ResourceId, ResourceRecord};
use kubesnap_core::repository::{RepoSettings, RepoState, RepositorySynchronizer};
use kubesnap_core::sanitizer::Sanitizer;
use kubesnap_core::selector::Selection;
use kubesnap_core::source::{FetchOutcome, ResourceSource};

// ===========================================================================
// Helpers
// ===========================================================================

/// A source whose records the test can swap between cycles.
#[derive(Clone, Default)]
struct SharedSource(Arc<Mutex<Vec<ResourceRecord>>>);

impl SharedSource {
    fn set(&self, records: Vec<ResourceRecord>) {
        *self.0.lock().unwrap() = records;
    }
}

impl ResourceSource for SharedSource {
    fn fetch(&self) -> Result<FetchOutcome, SourceError> {
        Ok(FetchOutcome {
            records: self.0.lock().unwrap().clone(),
            failures: Vec::new(),
        })
    }

    fn describe(&self) -> String {
        "shared test source".into()
    }
}

struct Fixture {
    _tmp: TempDir,
    remote: PathBuf,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let remote = root.join("origin.git");
        Repository::init_bare(&remote).unwrap();
        Self {
            _tmp: tmp,
            remote,
            root,
        }
    }

    fn remote_url(&self) -> String {
        self.remote.display().to_string()
    }

    fn synchronizer(&self, work: &str) -> RepositorySynchronizer {
        RepositorySynchronizer::new(
            RepoSettings {
                remote_url: self.remote_url(),
                branch: "main".into(),
                author_name: "Kube Git Backup".into(),
                author_email: "kube-backup@example.com".into(),
                work_dir: self.root.join(work),
            },
            GitAuth::Token {
                token: "unused-for-local-remotes".into(),
            },
        )
    }

    fn engine(&self, work: &str, source: &SharedSource) -> BackupEngine {
        BackupEngine::new(
            Box::new(source.clone()),
            Selection::all(),
            Sanitizer::default(),
            SnapshotTarget::Repository(self.synchronizer(work)),
        )
    }

    /// Sorted file paths on the remote `main` branch.
    fn remote_files(&self) -> Vec<String> {
        let repo = Repository::open_bare(&self.remote).unwrap();
        let tree = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_tree()
            .unwrap();
        let mut files = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                files.push(format!("{}{}", dir, entry.name().unwrap()));
            }
            git2::TreeWalkResult::Ok
        })
        .unwrap();
        files.sort();
        files
    }

    fn remote_file(&self, path: &str) -> String {
        let repo = Repository::open_bare(&self.remote).unwrap();
        let tree = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_tree()
            .unwrap();
        let entry = tree.get_path(Path::new(path)).unwrap();
        let blob = repo.find_blob(entry.id()).unwrap();
        String::from_utf8(blob.content().to_vec()).unwrap()
    }

    fn remote_commit_count(&self) -> usize {
        let repo = Repository::open_bare(&self.remote).unwrap();
        if repo.find_reference("refs/heads/main").is_err() {
            return 0;
        }
        let mut walk = repo.revwalk().unwrap();
        walk.push_ref("refs/heads/main").unwrap();
        walk.count()
    }

    fn remote_head_message(&self) -> String {
        let repo = Repository::open_bare(&self.remote).unwrap();
        let commit = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        commit.message().unwrap().to_string()
    }
}

fn config_map(ns: &str, name: &str, value: &str) -> ResourceRecord {
    record(
        "v1",
        "ConfigMap",
        ns,
        name,
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": ns,
                "uid": "0b5c1f",
                "resourceVersion": "12345"
            },
            "data": {"value": value}
        }),
    )
}

fn record(api_version: &str, kind: &str, ns: &str, name: &str, object: Value) -> ResourceRecord {
    ResourceRecord::new(ResourceId::new(api_version, kind, ns, name), object)
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn test_empty_remote_first_sync() {
    let fx = Fixture::new();
    let mut sync = fx.synchronizer("work");

    sync.initialize().unwrap();
    assert_eq!(sync.state(), RepoState::Ready);
    assert!(sync.is_unborn());

    let outcome = sync.sync(&[]).unwrap();
    assert_eq!(outcome.files_removed, 0);
    assert_eq!(outcome.commit_sha, None);
    assert!(!outcome.pushed);
    assert_eq!(sync.state(), RepoState::Ready);
    // Unborn branch persists until there is something to commit.
    assert!(sync.is_unborn());
    assert_eq!(fx.remote_commit_count(), 0);
}

#[test]
fn test_first_cycle_commits_and_pushes() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![config_map("default", "settings", "a")]);
    let engine = fx.engine("work", &source);

    let report = engine.run_cycle().unwrap();
    assert_eq!(report.files_written, 1);
    assert_eq!(report.files_removed, 0);
    assert!(report.pushed);
    let sha = report.commit_sha.expect("commit expected");

    assert_eq!(fx.remote_files(), vec!["namespaces/default/configmap/settings.yaml"]);
    assert_eq!(fx.remote_commit_count(), 1);
    assert!(fx
        .remote_head_message()
        .starts_with("Backup Kubernetes resources - "));

    let repo = Repository::open_bare(&fx.remote).unwrap();
    let head = repo.find_reference("refs/heads/main").unwrap();
    assert_eq!(head.target().unwrap().to_string(), sha);
    let commit = head.peel_to_commit().unwrap();
    assert_eq!(commit.author().name(), Some("Kube Git Backup"));
    assert_eq!(commit.parent_count(), 0);

    let content = fx.remote_file("namespaces/default/configmap/settings.yaml");
    assert!(!content.contains("uid"));
    assert!(!content.contains("resourceVersion"));
    assert!(content.contains("value: a"));
}

#[test]
fn test_unchanged_cycle_makes_no_commit() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![
        config_map("default", "a", "1"),
        config_map("default", "b", "2"),
    ]);
    let engine = fx.engine("work", &source);

    assert!(engine.run_cycle().unwrap().commit_sha.is_some());
    let second = engine.run_cycle().unwrap();
    assert_eq!(second.commit_sha, None);
    assert!(!second.pushed);
    assert_eq!(second.files_written, 0);
    assert_eq!(second.files_removed, 0);
    assert_eq!(fx.remote_commit_count(), 1);
}

#[test]
fn test_deletion_reconciliation() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    let engine = fx.engine("work", &source);

    source.set(vec![
        config_map("ns1", "a", "1"),
        config_map("ns2", "b", "2"),
    ]);
    engine.run_cycle().unwrap();
    let b_path = fx.root.join("work/namespaces/ns2/configmap/b.yaml");
    let b_modified = std::fs::metadata(&b_path).unwrap().modified().unwrap();

    source.set(vec![
        config_map("ns2", "b", "2"),
        config_map("ns2", "c", "3"),
    ]);
    let report = engine.run_cycle().unwrap();
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.files_written, 1);
    assert!(report.commit_sha.is_some());

    assert_eq!(
        fx.remote_files(),
        vec![
            "namespaces/ns2/configmap/b.yaml",
            "namespaces/ns2/configmap/c.yaml",
        ]
    );
    assert_eq!(std::fs::metadata(&b_path).unwrap().modified().unwrap(), b_modified);
    assert!(!fx.root.join("work/namespaces/ns1").exists());
}

#[test]
fn test_empty_cluster_removes_everything() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    let engine = fx.engine("work", &source);

    source.set(vec![
        config_map("default", "a", "1"),
        record(
            "v1",
            "Namespace",
            "",
            "default",
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "default"}}),
        ),
    ]);
    engine.run_cycle().unwrap();
    assert_eq!(fx.remote_files().len(), 2);

    source.set(Vec::new());
    let report = engine.run_cycle().unwrap();
    assert_eq!(report.files_removed, 2);
    assert!(report.commit_sha.is_some());
    assert!(fx.remote_files().is_empty());
    assert_eq!(fx.remote_commit_count(), 2);

    let again = engine.run_cycle().unwrap();
    assert_eq!(again.commit_sha, None);
    assert_eq!(fx.remote_commit_count(), 2);
}

#[test]
fn test_service_scenario() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![record(
        "v1",
        "Service",
        "default",
        "web",
        json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 80, "nodePort": 30080}]}}),
    )]);
    let engine = fx.engine("work", &source);
    engine.run_cycle().unwrap();

    assert_eq!(fx.remote_files(), vec!["namespaces/default/service/web.yaml"]);
    let content = fx.remote_file("namespaces/default/service/web.yaml");
    let doc: Value = serde_yaml::from_str(&content).unwrap();
    assert_eq!(doc, json!({"spec": {"ports": [{"port": 80}]}}));
}

#[test]
fn test_restart_clones_existing_branch() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![config_map("default", "a", "1")]);
    fx.engine("first", &source).run_cycle().unwrap();

    // A fresh working directory, as after a pod restart.
    let mut sync = fx.synchronizer("second");
    sync.initialize().unwrap();
    assert!(!sync.is_unborn());
    assert!(fx
        .root
        .join("second/namespaces/default/configmap/a.yaml")
        .exists());

    let restarted = BackupEngine::new(
        Box::new(source.clone()),
        Selection::all(),
        Sanitizer::default(),
        SnapshotTarget::Repository(sync),
    );
    let report = restarted.run_cycle().unwrap();
    assert_eq!(report.commit_sha, None);
    assert_eq!(fx.remote_commit_count(), 1);
}

#[test]
fn test_pulls_external_commits_before_writing() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![config_map("default", "a", "1")]);
    let engine = fx.engine("work", &source);
    engine.run_cycle().unwrap();

    // Someone adds a README directly on the branch.
    let auth = GitAuth::Token {
        token: "unused".into(),
    };
    let other_dir = fx.root.join("other");
    let other = GitClient::clone_repo(&fx.remote_url(), &other_dir, &auth).unwrap();
    other.checkout_branch("main").unwrap();
    std::fs::write(other_dir.join("README.md"), "cluster backup\n").unwrap();
    other.stage_all().unwrap();
    other.commit("Add README", "Ops", "ops@example.com").unwrap();
    other.push("main", &auth).unwrap();

    source.set(vec![
        config_map("default", "a", "1"),
        config_map("default", "b", "2"),
    ]);
    let report = engine.run_cycle().unwrap();
    assert!(report.pushed);
    assert_eq!(
        fx.remote_files(),
        vec![
            "README.md",
            "namespaces/default/configmap/a.yaml",
            "namespaces/default/configmap/b.yaml",
        ]
    );
    assert_eq!(fx.remote_commit_count(), 3);
}

#[test]
fn test_unreachable_remote_faults_cycle() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![config_map("default", "a", "1")]);
    let engine = fx.engine("work", &source);
    engine.run_cycle().unwrap();

    std::fs::remove_dir_all(&fx.remote).unwrap();
    source.set(vec![config_map("default", "a", "2")]);
    assert!(engine.run_cycle().is_err());
    assert_eq!(engine.repo_state(), Some(RepoState::Faulted));

    // The remote comes back empty; the next cycle pushes the full snapshot.
    Repository::init_bare(&fx.remote).unwrap();
    let report = engine.run_cycle().unwrap();
    assert_eq!(engine.repo_state(), Some(RepoState::Ready));
    assert!(report.pushed);
    let doc: Value =
        serde_yaml::from_str(&fx.remote_file("namespaces/default/configmap/a.yaml")).unwrap();
    assert_eq!(doc["data"]["value"], "2");
}

#[test]
fn test_failed_push_is_retried_on_unchanged_cycle() {
    let fx = Fixture::new();
    let source = SharedSource::default();
    source.set(vec![config_map("default", "a", "1")]);
    let engine = fx.engine("work", &source);
    engine.run_cycle().unwrap();

    // Only pushes break: the commit lands locally but never reaches origin.
    let work = Repository::open(fx.root.join("work")).unwrap();
    work.remote_set_pushurl("origin", Some("/nonexistent/push.git"))
        .unwrap();
    source.set(vec![config_map("default", "a", "2")]);
    assert!(engine.run_cycle().is_err());
    assert_eq!(engine.repo_state(), Some(RepoState::Faulted));
    assert_eq!(fx.remote_commit_count(), 1);

    work.remote_set_pushurl("origin", None).unwrap();
    let report = engine.run_cycle().unwrap();
    assert_eq!(engine.repo_state(), Some(RepoState::Ready));
    assert_eq!(report.commit_sha, None);
    assert!(report.pushed);
    assert_eq!(fx.remote_commit_count(), 2);
    let doc: Value =
        serde_yaml::from_str(&fx.remote_file("namespaces/default/configmap/a.yaml")).unwrap();
    assert_eq!(doc["data"]["value"], "2");

    // Nothing left to push afterwards.
    let quiet = engine.run_cycle().unwrap();
    assert!(!quiet.pushed);
    assert_eq!(fx.remote_commit_count(), 2);
}

#[test]
fn test_partial_listing_failure_still_commits_the_rest() {
    struct PartialSource;

    impl ResourceSource for PartialSource {
        fn fetch(&self) -> Result<FetchOutcome, SourceError> {
            Ok(FetchOutcome {
                records: vec![config_map("default", "settings", "a")],
                failures: vec![SourceError::ListFailed {
                    kind: "Deployment".into(),
                    detail: "forbidden".into(),
                }],
            })
        }

        fn describe(&self) -> String {
            "partial".into()
        }
    }

    let fx = Fixture::new();
    let engine = BackupEngine::new(
        Box::new(PartialSource),
        Selection::all(),
        Sanitizer::default(),
        SnapshotTarget::Repository(fx.synchronizer("work")),
    );

    let report = engine.run_cycle().unwrap();
    assert_eq!(report.source_failures, 1);
    assert!(report.is_partial());
    assert!(report.commit_sha.is_some());
    assert!(report.pushed);
    assert_eq!(fx.remote_files(), vec!["namespaces/default/configmap/settings.yaml"]);
}
