//! Git repository handle.
//!
//! Wraps libgit2 behind a blocking-friendly API: clone-or-open on
//! initialize, fetch + fast-forward on pull. Callers run these on a
//! blocking thread (`tokio::task::spawn_blocking`); nothing here touches
//! the async runtime.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use config::GitAuth;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks};
use tracing::{debug, info};

use crate::GitError;

/// Settings for the configuration repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
    pub auth: GitAuth,
    /// path of the DHCP config file inside the repository
    pub config_path: String,
}

/// Metadata of a commit at HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Handle over the local checkout of the config repository.
///
/// `git2::Repository` is `Send` but not `Sync`, so the inner handle lives
/// behind a mutex; operations hold it for the duration of one git call.
pub struct Repository {
    cfg: RepoConfig,
    repo: Mutex<Option<git2::Repository>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("cfg", &self.cfg).finish()
    }
}

impl Repository {
    pub fn new(cfg: RepoConfig) -> Self {
        Self {
            cfg,
            repo: Mutex::new(None),
        }
    }

    /// Full path of the config file inside the checkout.
    pub fn config_file_path(&self) -> PathBuf {
        self.cfg.local_path.join(&self.cfg.config_path)
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let auth = self.cfg.auth.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| match &auth {
            GitAuth::Token(token) => Cred::userpass_plaintext("git", token),
            GitAuth::Ssh { key_path } => Cred::ssh_key(
                username_from_url.unwrap_or("git"),
                None,
                Path::new(key_path),
                None,
            ),
            GitAuth::None => Cred::default(),
        });
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(callbacks);
        opts
    }

    /// Open the existing checkout, or clone the configured branch.
    pub fn initialize(&self) -> Result<(), GitError> {
        let mut slot = self.repo.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        if self.cfg.local_path.join(".git").exists() {
            let repo = git2::Repository::open(&self.cfg.local_path)?;
            info!(path = %self.cfg.local_path.display(), "opened existing config repository");
            *slot = Some(repo);
            return Ok(());
        }

        info!(
            url = %self.cfg.url,
            branch = %self.cfg.branch,
            path = %self.cfg.local_path.display(),
            "cloning config repository"
        );
        if let Some(parent) = self.cfg.local_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| GitError::Task(format!("creating {}: {err}", parent.display())))?;
        }
        let repo = RepoBuilder::new()
            .branch(&self.cfg.branch)
            .fetch_options(self.fetch_options())
            .clone(&self.cfg.url, &self.cfg.local_path)?;
        *slot = Some(repo);
        Ok(())
    }

    /// Fetch the configured branch and fast-forward the local checkout.
    /// Returns HEAD's commit metadata and whether HEAD moved.
    pub fn pull(&self) -> Result<(CommitInfo, bool), GitError> {
        let slot = self.repo.lock().unwrap();
        let repo = slot.as_ref().ok_or(GitError::NotInitialized)?;

        let head_before = repo.head()?.target();

        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &[self.cfg.branch.as_str()],
            Some(&mut self.fetch_options()),
            None,
        )?;
        drop(remote);

        let remote_ref = format!("refs/remotes/origin/{}", self.cfg.branch);
        let target = repo.refname_to_id(&remote_ref)?;

        let has_changes = head_before != Some(target);
        if has_changes {
            let local_ref = format!("refs/heads/{}", self.cfg.branch);
            let mut reference = repo.find_reference(&local_ref)?;
            reference.set_target(target, "fast-forward")?;
            repo.set_head(&local_ref)?;
            repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
            info!(commit = %target, "pulled new changes from config repository");
        } else {
            debug!("config repository already up to date");
        }

        Ok((commit_info(repo, target)?, has_changes))
    }

    /// Commit metadata at the current HEAD.
    pub fn current_commit(&self) -> Result<CommitInfo, GitError> {
        let slot = self.repo.lock().unwrap();
        let repo = slot.as_ref().ok_or(GitError::NotInitialized)?;
        let head = repo
            .head()?
            .target()
            .ok_or_else(|| GitError::Task("HEAD is unborn".into()))?;
        commit_info(repo, head)
    }
}

fn commit_info(repo: &git2::Repository, oid: git2::Oid) -> Result<CommitInfo, GitError> {
    let commit = repo.find_commit(oid)?;
    let author = commit.author();
    Ok(CommitInfo {
        hash: commit.id().to_string(),
        message: commit.message().unwrap_or_default().to_string(),
        author: author.name().unwrap_or_default().to_string(),
        timestamp: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0),
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    /// Build a source repository with an initial commit on `main`.
    pub(crate) fn init_source_repo(path: &Path) -> git2::Repository {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        git2::Repository::init_opts(path, &opts).unwrap()
    }

    pub(crate) fn commit_file(
        repo: &git2::Repository,
        rel: &str,
        contents: &str,
        message: &str,
    ) -> git2::Oid {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(rel), contents).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("ops", "ops@example.com").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .map(|oid| repo.find_commit(oid).unwrap());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{commit_file, init_source_repo};
    use super::*;
    use tempfile::TempDir;

    fn repo_pair(contents: &str) -> (TempDir, TempDir, Repository) {
        let source_dir = TempDir::new().unwrap();
        let clone_dir = TempDir::new().unwrap();
        let source = init_source_repo(source_dir.path());
        commit_file(&source, "dhcp.yaml", contents, "initial config");

        let checkout = clone_dir.path().join("checkout");
        let repo = Repository::new(RepoConfig {
            url: source_dir.path().to_str().unwrap().to_string(),
            branch: "main".into(),
            local_path: checkout,
            auth: GitAuth::None,
            config_path: "dhcp.yaml".into(),
        });
        (source_dir, clone_dir, repo)
    }

    #[test]
    fn clone_then_pull_reports_no_changes() {
        let (_source, _clone, repo) = repo_pair("subnets: []\n");
        repo.initialize().unwrap();
        // re-initialize opens the existing checkout
        repo.initialize().unwrap();

        let (commit, has_changes) = repo.pull().unwrap();
        assert!(!has_changes);
        assert_eq!(commit.message.trim(), "initial config");
        assert_eq!(commit.author, "ops");
        assert_eq!(repo.current_commit().unwrap().hash, commit.hash);
        assert!(repo.config_file_path().exists());
    }

    #[test]
    fn pull_fast_forwards_to_new_commits() {
        let (source_dir, _clone, repo) = repo_pair("subnets: []\n");
        repo.initialize().unwrap();
        let (first, _) = repo.pull().unwrap();

        let source = git2::Repository::open(source_dir.path()).unwrap();
        commit_file(&source, "dhcp.yaml", "subnets: [] # v2\n", "second config");

        let (second, has_changes) = repo.pull().unwrap();
        assert!(has_changes);
        assert_ne!(first.hash, second.hash);
        assert_eq!(second.message.trim(), "second config");
        let on_disk = std::fs::read_to_string(repo.config_file_path()).unwrap();
        assert!(on_disk.contains("v2"));
    }

    #[test]
    fn pull_before_initialize_fails() {
        let (_source, _clone, repo) = repo_pair("subnets: []\n");
        assert!(matches!(repo.pull(), Err(GitError::NotInitialized)));
    }
}
