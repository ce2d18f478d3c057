//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions, Repository, Signature};
use tracing::{debug, info, instrument, warn};

use crate::errors::{GitResultExt, RepoErrorKind, RepositoryError};

use super::auth::GitAuth;

/// Name of the remote the backup branch is pushed to.
pub const REMOTE_NAME: &str = "origin";

/// How the configured branch was resolved after opening the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// A local branch already existed.
    Local,
    /// Created from the remote-tracking branch.
    Tracking,
    /// No commits yet; the first commit creates the branch.
    Unborn,
}

/// Result of a fast-forward pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The remote has no such branch yet.
    NoUpstream,
    UpToDate,
    FastForwarded,
}

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing working tree at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, RepositoryError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| RepositoryError::NotARepository(path.display().to_string()))?;
        if repo.is_bare() {
            return Err(RepositoryError::NotARepository(path.display().to_string()));
        }
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone `url` into `path`.
    ///
    /// A remote without any branches cannot be checked out; in that case a
    /// fresh repository is initialized with `origin` pointing at `url`.
    #[instrument(skip(auth), fields(url = %url, path = %path.display()))]
    pub fn clone_repo(url: &str, path: &Path, auth: &GitAuth) -> Result<Self, RepositoryError> {
        info!("cloning git repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(auth.remote_callbacks());
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_opts);

        match builder.clone(url, path) {
            Ok(repo) => {
                info!("clone completed");
                Ok(Self {
                    repo,
                    repo_path: path.to_path_buf(),
                })
            }
            Err(e) if RepoErrorKind::classify(&e) == RepoErrorKind::EmptyRemote => {
                warn!(error = %e, "remote repository is empty, initializing a new one");
                Self::init_with_remote(path, url)
            }
            Err(e) => Err(e).during("clone"),
        }
    }

    /// Initialize an empty working tree with `origin` set to `url`.
    pub fn init_with_remote(path: &Path, url: &str) -> Result<Self, RepositoryError> {
        let repo = Repository::init(path).during("init")?;
        repo.remote(REMOTE_NAME, url).during("add remote")?;
        info!(path = %path.display(), "initialized new repository");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Point `origin` at `url` if it currently points elsewhere.
    pub fn ensure_remote_url(&self, url: &str) -> Result<(), RepositoryError> {
        match self.repo.find_remote(REMOTE_NAME) {
            Ok(remote) if remote.url() == Some(url) => Ok(()),
            Ok(remote) => {
                warn!(
                    old = remote.url().unwrap_or("<non-utf8>"),
                    new = url,
                    "updating origin URL"
                );
                self.repo.remote_set_url(REMOTE_NAME, url).during("set remote url")
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                self.repo.remote(REMOTE_NAME, url).during("add remote")?;
                Ok(())
            }
            Err(e) => Err(e).during("find remote"),
        }
    }

    /// Check out `branch`, creating it from `origin/<branch>` if only the
    /// remote-tracking branch exists, or leaving HEAD on an unborn branch if
    /// neither exists.
    #[instrument(skip(self))]
    pub fn checkout_branch(&self, branch: &str) -> Result<BranchState, RepositoryError> {
        let local_ref = format!("refs/heads/{branch}");

        if self.repo.find_branch(branch, BranchType::Local).is_ok() {
            self.repo.set_head(&local_ref).during("checkout")?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))
                .during("checkout")?;
            debug!("checked out existing local branch");
            return Ok(BranchState::Local);
        }

        let tracking_ref = format!("refs/remotes/{REMOTE_NAME}/{branch}");
        match self.repo.find_reference(&tracking_ref) {
            Ok(reference) => {
                let commit = reference.peel_to_commit().during("checkout")?;
                let mut local = self.repo.branch(branch, &commit, false).during("create branch")?;
                local
                    .set_upstream(Some(&format!("{REMOTE_NAME}/{branch}")))
                    .during("set upstream")?;
                self.repo.set_head(&local_ref).during("checkout")?;
                self.repo
                    .checkout_head(Some(CheckoutBuilder::new().force()))
                    .during("checkout")?;
                info!(sha = %commit.id(), "created local branch from remote");
                Ok(BranchState::Tracking)
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                self.repo.set_head(&local_ref).during("checkout")?;
                info!("branch does not exist yet, starting unborn");
                Ok(BranchState::Unborn)
            }
            Err(e) => Err(e).during("checkout"),
        }
    }

    /// True when HEAD points to a branch without commits.
    pub fn is_unborn(&self) -> bool {
        matches!(self.repo.head(), Err(e) if e.code() == ErrorCode::UnbornBranch)
    }

    /// Fetch all branches from `origin`.
    #[instrument(skip(self, auth))]
    pub fn fetch(&self, auth: &GitAuth) -> Result<(), RepositoryError> {
        info!(remote = REMOTE_NAME, "fetching");
        let mut remote = self.repo.find_remote(REMOTE_NAME).during("fetch")?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(auth.remote_callbacks());
        remote
            .fetch(&[] as &[&str], Some(&mut fetch_opts), None)
            .during("fetch")?;
        debug!("fetch completed");
        Ok(())
    }

    /// Fetch and fast-forward `branch` to `origin/<branch>`.
    ///
    /// Histories that cannot be fast-forwarded are reported as
    /// [`RepositoryError::Diverged`] and leave the working tree untouched.
    #[instrument(skip(self, auth))]
    pub fn pull(&self, branch: &str, auth: &GitAuth) -> Result<PullOutcome, RepositoryError> {
        self.fetch(auth)?;

        let tracking_ref = format!("refs/remotes/{REMOTE_NAME}/{branch}");
        let fetch_commit = match self.repo.find_reference(&tracking_ref) {
            Ok(r) => r.peel_to_commit().during("pull")?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!("remote branch does not exist yet");
                return Ok(PullOutcome::NoUpstream);
            }
            Err(e) => return Err(e).during("pull"),
        };

        let local_ref = format!("refs/heads/{branch}");
        if self.is_unborn() {
            self.repo
                .reference(&local_ref, fetch_commit.id(), true, "kubesnap: adopt remote branch")
                .during("pull")?;
            self.repo.set_head(&local_ref).during("pull")?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))
                .during("pull")?;
            info!(sha = %fetch_commit.id(), "adopted remote branch");
            return Ok(PullOutcome::FastForwarded);
        }

        let annotated = self
            .repo
            .find_annotated_commit(fetch_commit.id())
            .during("pull")?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated]).during("pull")?;

        if analysis.is_up_to_date() {
            debug!("already up to date");
            Ok(PullOutcome::UpToDate)
        } else if analysis.is_fast_forward() {
            let mut head_ref = self.repo.find_reference(&local_ref).during("pull")?;
            head_ref
                .set_target(fetch_commit.id(), "kubesnap: fast-forward pull")
                .during("pull")?;
            self.repo.set_head(&local_ref).during("pull")?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))
                .during("pull")?;
            info!(sha = %fetch_commit.id(), "fast-forwarded");
            Ok(PullOutcome::FastForwarded)
        } else {
            warn!("local and remote histories have diverged");
            Err(RepositoryError::Diverged {
                branch: branch.to_string(),
            })
        }
    }

    /// Stage every addition, modification and deletion in the working tree.
    ///
    /// Returns the number of paths that differ from HEAD afterwards.
    pub fn stage_all(&self) -> Result<usize, RepositoryError> {
        let mut index = self.repo.index().during("stage")?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .during("stage")?;
        index.update_all(["*"].iter(), None).during("stage")?;
        index.write().during("stage")?;

        let head_tree = match self.repo.head() {
            Ok(head) => Some(head.peel_to_tree().during("stage")?),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
            Err(e) => return Err(e).during("stage"),
        };
        let diff = self
            .repo
            .diff_tree_to_index(head_tree.as_ref(), Some(&index), None)
            .during("stage")?;
        let changed = diff.deltas().len();
        debug!(changed, "staged working tree");
        Ok(changed)
    }

    /// Commit the current index. On an unborn branch this creates the root
    /// commit and the branch itself.
    #[instrument(skip(self, message))]
    pub fn commit(
        &self,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Oid, RepositoryError> {
        let mut index = self.repo.index().during("commit")?;
        let tree_oid = index.write_tree().during("commit")?;
        let tree = self.repo.find_tree(tree_oid).during("commit")?;
        let signature = Signature::now(author_name, author_email).during("commit")?;
        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit().during("commit")?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .during("commit")?;
        info!(sha = %oid, "created commit");
        Ok(oid)
    }

    /// Push `branch` to `origin`.
    #[instrument(skip(self, auth))]
    pub fn push(&self, branch: &str, auth: &GitAuth) -> Result<(), RepositoryError> {
        info!(remote = REMOTE_NAME, branch, "pushing");
        let mut remote = self.repo.find_remote(REMOTE_NAME).during("push")?;
        let mut rejection: Option<String> = None;

        let mut callbacks = auth.remote_callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                rejection = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let pushed = remote.push(&[&refspec], Some(&mut push_opts));
        drop(push_opts);
        pushed.during("push")?;

        if let Some(detail) = rejection {
            return Err(RepositoryError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Whether the local `branch` holds commits that `origin` has not seen.
    ///
    /// Compares against the remote-tracking ref from the last fetch. An
    /// unborn branch never has anything to push.
    pub fn has_unpushed_commits(&self, branch: &str) -> Result<bool, RepositoryError> {
        let local = match self.repo.find_reference(&format!("refs/heads/{branch}")) {
            Ok(r) => r.target(),
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e).during("status"),
        };
        let Some(local) = local else {
            return Ok(false);
        };

        let tracking_ref = format!("refs/remotes/{REMOTE_NAME}/{branch}");
        match self.repo.find_reference(&tracking_ref) {
            Ok(r) => Ok(r.target() != Some(local)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(true),
            Err(e) => Err(e).during("status"),
        }
    }

    /// SHA of HEAD, or `None` on an unborn branch.
    pub fn head_sha(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id().to_string())
    }
}
