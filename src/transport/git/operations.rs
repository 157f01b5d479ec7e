//! Version control operations
//!
//! The git loader depends only on [`VersionControl`]. [`Git2VersionControl`]
//! implements it with libgit2 against a single local checkout. All methods
//! block; callers run them on the blocking pool.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, Delta, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SchemaError};

const REMOTE: &str = "origin";
const DEFAULT_AUTHOR: &str = "Schema Server";
const DEFAULT_EMAIL: &str = "schema-server@localhost";

/// Summary of what a changeset branch changes relative to its base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetOverview {
    pub additions: usize,
    pub changes: usize,
    pub deletions: usize,
    pub author: String,
    pub description: String,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Operations the git loader needs from a version control system
pub trait VersionControl: Send + Sync {
    fn description(&self) -> String;

    /// Clone if absent, then check out `branch` and fast-forward it to the
    /// remote. Returns whether the working tree changed.
    fn fetch_latest(&self, branch: &str) -> Result<bool>;

    /// Create `branch` from HEAD, switch to it and push it
    fn create_branch(&self, branch: &str) -> Result<()>;

    /// Stage everything, commit (even when empty) and push the current branch
    fn commit_and_push(&self, message: &str) -> Result<()>;

    /// Local and remote branch names, without the remote prefix
    fn list_branches(&self) -> Result<Vec<String>>;

    fn current_branch(&self) -> Result<String>;

    fn rename_branch(&self, from: &str, to: &str) -> Result<()>;

    /// Push `branch` and return a link for reviewing it against `base`
    fn raise_pull_request(&self, branch: &str, base: &str, description: &str) -> Result<String>;

    fn changeset_overview(&self, branch: &str, base: &str) -> Result<ChangesetOverview>;
}

pub struct Git2VersionControl {
    uri: String,
    working_dir: PathBuf,
    hosting_url_template: Option<String>,
    // libgit2 handles are not shared; this serializes operations on the checkout
    lock: Mutex<()>,
}

impl Git2VersionControl {
    pub fn new(uri: impl Into<String>, working_dir: impl Into<PathBuf>, hosting_url_template: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            working_dir: working_dir.into(),
            hosting_url_template,
            lock: Mutex::new(()),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn exists_locally(&self) -> bool {
        self.working_dir.join(".git").exists()
    }

    fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.working_dir)?)
    }

    fn clone_repository(&self) -> Result<Repository> {
        if let Some(parent) = self.working_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(uri = %self.uri, dir = %self.working_dir.display(), "Cloning repository");
        Ok(Repository::clone(&self.uri, &self.working_dir)?)
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Ok(Signature::now(DEFAULT_AUTHOR, DEFAULT_EMAIL)?),
    }
}

fn local_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

fn remote_ref(branch: &str) -> String {
    format!("refs/remotes/{}/{}", REMOTE, branch)
}

fn fetch(repo: &Repository) -> Result<()> {
    let mut remote = repo.find_remote(REMOTE)?;
    remote.fetch(&[] as &[&str], None, None)?;
    Ok(())
}

fn push(repo: &Repository, refspec: &str) -> Result<()> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.push_update_reference(|reference, status| match status {
        Some(message) => Err(git2::Error::from_str(&format!(
            "push of {} rejected: {}",
            reference, message
        ))),
        None => Ok(()),
    });
    let mut options = PushOptions::new();
    options.remote_callbacks(callbacks);

    let mut remote = repo.find_remote(REMOTE)?;
    remote.push(&[refspec], Some(&mut options))?;
    debug!(refspec, "Pushed");
    Ok(())
}

fn push_branch(repo: &Repository, branch: &str) -> Result<()> {
    push(repo, &format!("{0}:{0}", local_ref(branch)))
}

/// Switch the working tree to `branch`, creating a local branch from the
/// remote one when needed
fn checkout(repo: &Repository, branch: &str) -> Result<()> {
    let local_name = local_ref(branch);
    if repo.find_reference(&local_name).is_err() {
        let commit = repo
            .find_reference(&remote_ref(branch))
            .and_then(|r| r.peel_to_commit())
            .map_err(|_| SchemaError::Transport(format!("branch '{}' not found locally or on {}", branch, REMOTE)))?;
        let mut created = repo.branch(branch, &commit, false)?;
        created.set_upstream(Some(format!("{}/{}", REMOTE, branch).as_str()))?;
    }

    let target = repo.revparse_single(&local_name)?;
    let mut options = CheckoutBuilder::new();
    options.force();
    repo.checkout_tree(&target, Some(&mut options))?;
    repo.set_head(&local_name)?;
    Ok(())
}

/// Fast-forward the checked out `branch` to its remote counterpart
fn fast_forward(repo: &Repository, branch: &str) -> Result<bool> {
    let remote = match repo.find_reference(&remote_ref(branch)) {
        Ok(reference) => reference,
        // Never pushed; nothing to pull
        Err(_) => return Ok(false),
    };
    let incoming = repo.reference_to_annotated_commit(&remote)?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;

    if analysis.is_up_to_date() {
        return Ok(false);
    }
    if !analysis.is_fast_forward() {
        return Err(SchemaError::Transport(format!(
            "branch '{}' has diverged from {}",
            branch, REMOTE
        )));
    }

    let mut local = repo.find_reference(&local_ref(branch))?;
    local.set_target(incoming.id(), &format!("fast-forward {} to {}", branch, incoming.id()))?;
    repo.set_head(&local_ref(branch))?;
    let mut options = CheckoutBuilder::new();
    options.force();
    repo.checkout_head(Some(&mut options))?;
    Ok(true)
}

fn resolve_commit<'r>(repo: &'r Repository, branch: &str) -> Result<Commit<'r>> {
    repo.find_reference(&local_ref(branch))
        .or_else(|_| repo.find_reference(&remote_ref(branch)))
        .and_then(|r| r.peel_to_commit())
        .map_err(|_| SchemaError::PackageNotFound(format!("branch '{}'", branch)))
}

impl VersionControl for Git2VersionControl {
    fn description(&self) -> String {
        format!("{} at {}", self.uri, self.working_dir.display())
    }

    fn fetch_latest(&self, branch: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        if !self.exists_locally() {
            let repo = self.clone_repository()?;
            checkout(&repo, branch)?;
            return Ok(true);
        }

        let repo = self.open()?;
        fetch(&repo)?;
        let switched = repo.head().ok().and_then(|h| h.shorthand().map(String::from)).as_deref() != Some(branch);
        checkout(&repo, branch)?;
        let pulled = fast_forward(&repo, branch)?;
        if pulled {
            info!(branch, dir = %self.working_dir.display(), "Pulled new commits");
        }
        Ok(switched || pulled)
    }

    fn create_branch(&self, branch: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?;
        info!(branch, "Creating and switching to branch");
        repo.branch(branch, &head, false)?;
        checkout(&repo, branch)?;

        push_branch(&repo, branch)?;
        let mut created = repo.find_branch(branch, BranchType::Local)?;
        created.set_upstream(Some(format!("{}/{}", REMOTE, branch).as_str()))?;
        info!(branch, "Branch pushed to remote");
        Ok(())
    }

    fn commit_and_push(&self, message: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let repo = self.open()?;

        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let sig = signature(&repo)?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(commit = %oid, message, "Committed");

        let branch = repo
            .head()?
            .shorthand()
            .map(String::from)
            .ok_or_else(|| SchemaError::Transport("HEAD is detached".to_string()))?;
        push_branch(&repo, &branch)
    }

    fn list_branches(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let repo = self.open()?;
        let mut names = BTreeSet::new();
        for entry in repo.branches(None)? {
            let (branch, kind) = entry?;
            let Some(name) = branch.name()? else { continue };
            let name = match kind {
                BranchType::Local => name,
                BranchType::Remote => match name.strip_prefix(&format!("{}/", REMOTE)) {
                    Some(name) => name,
                    None => continue,
                },
            };
            if name != "HEAD" {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    fn current_branch(&self) -> Result<String> {
        let _guard = self.lock.lock();
        let repo = self.open()?;
        let head = repo.head()?;
        head.shorthand()
            .map(String::from)
            .ok_or_else(|| SchemaError::Transport("HEAD is detached".to_string()))
    }

    fn rename_branch(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let repo = self.open()?;
        let mut branch = repo.find_branch(from, BranchType::Local)?;
        branch.rename(to, false)?;
        info!(from, to, "Renamed branch");

        push_branch(&repo, to)?;
        if repo.find_reference(&remote_ref(from)).is_ok() {
            push(&repo, &format!(":{}", local_ref(from)))?;
        }
        let mut renamed = repo.find_branch(to, BranchType::Local)?;
        renamed.set_upstream(Some(format!("{}/{}", REMOTE, to).as_str()))?;
        Ok(())
    }

    fn raise_pull_request(&self, branch: &str, base: &str, description: &str) -> Result<String> {
        let template = self.hosting_url_template.as_deref().ok_or_else(|| {
            SchemaError::Configuration(format!(
                "no pull request hosting url configured for {}",
                self.uri
            ))
        })?;
        {
            let _guard = self.lock.lock();
            let repo = self.open()?;
            push_branch(&repo, branch)?;
        }
        let link = template.replace("{branch}", branch).replace("{base}", base);
        info!(branch, base, link = %link, description, "Raised pull request");
        Ok(link)
    }

    fn changeset_overview(&self, branch: &str, base: &str) -> Result<ChangesetOverview> {
        let _guard = self.lock.lock();
        let repo = self.open()?;
        let head = resolve_commit(&repo, branch)?;
        let base_commit = resolve_commit(&repo, base)?;
        let merge_base = repo.merge_base(base_commit.id(), head.id())?;
        let base_tree = repo.find_commit(merge_base)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head.tree()?), None)?;

        let (mut additions, mut changes, mut deletions) = (0, 0, 0);
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added | Delta::Copied => additions += 1,
                Delta::Deleted => deletions += 1,
                Delta::Modified | Delta::Renamed | Delta::Typechange => changes += 1,
                _ => {}
            }
        }

        let author = head.author();
        Ok(ChangesetOverview {
            additions,
            changes,
            deletions,
            author: author.name().unwrap_or_default().to_string(),
            description: head.summary().unwrap_or_default().to_string(),
            last_updated: Utc.timestamp_opt(head.time().seconds(), 0).single(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use git2::RepositoryInitOptions;
    use tempfile::TempDir;

    /// A bare "remote" holding `main` with one file, and a seeding clone
    pub(crate) fn remote_with_main(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let remote = dir.join("remote.git");
        let mut bare = RepositoryInitOptions::new();
        bare.bare(true).initial_head("main");
        Repository::init_opts(&remote, &bare).unwrap();

        let seed = dir.join("seed");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&seed, &opts).unwrap();
        repo.remote(REMOTE, remote.to_str().unwrap()).unwrap();
        commit_files(&repo, files, "initial");
        push_branch(&repo, "main").unwrap();
        remote
    }

    pub(crate) fn commit_files(repo: &Repository, files: &[(&str, &str)], message: &str) {
        let workdir = repo.workdir().unwrap().to_path_buf();
        for (name, content) in files {
            let path = workdir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let mut index = repo.index().unwrap();
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents).unwrap();
    }

    #[test]
    fn test_fetch_latest_clones_then_pulls() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(dir.path(), &[("src/a.taxi", "type A inherits String")]);
        let checkout = dir.path().join("checkouts/films");
        let vcs = Git2VersionControl::new(remote.to_str().unwrap(), &checkout, None);

        assert!(vcs.fetch_latest("main").unwrap());
        assert!(checkout.join("src/a.taxi").exists());
        assert!(!vcs.fetch_latest("main").unwrap());

        let seed = Repository::open(dir.path().join("seed")).unwrap();
        commit_files(&seed, &[("src/b.taxi", "type B inherits String")], "add b");
        push_branch(&seed, "main").unwrap();

        assert!(vcs.fetch_latest("main").unwrap());
        assert!(checkout.join("src/b.taxi").exists());
        assert_eq!(vcs.current_branch().unwrap(), "main");
    }

    #[test]
    fn test_missing_branch_fails() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(dir.path(), &[("a.taxi", "type A")]);
        let vcs = Git2VersionControl::new(remote.to_str().unwrap(), dir.path().join("co"), None);
        vcs.fetch_latest("main").unwrap();
        assert!(vcs.fetch_latest("does-not-exist").is_err());
        assert_eq!(vcs.current_branch().unwrap(), "main");
    }

    #[test]
    fn test_branch_lifecycle() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(dir.path(), &[("a.taxi", "type A")]);
        let checkout = dir.path().join("co");
        let vcs = Git2VersionControl::new(
            remote.to_str().unwrap(),
            &checkout,
            Some("https://git.example.com/compare/{base}...{branch}".to_string()),
        );
        vcs.fetch_latest("main").unwrap();

        vcs.create_branch("schema-updates/films").unwrap();
        assert_eq!(vcs.current_branch().unwrap(), "schema-updates/films");

        std::fs::write(checkout.join("b.taxi"), "type B").unwrap();
        std::fs::write(checkout.join("a.taxi"), "type A inherits String").unwrap();
        vcs.commit_and_push("add films").unwrap();

        let overview = vcs.changeset_overview("schema-updates/films", "main").unwrap();
        assert_eq!((overview.additions, overview.changes, overview.deletions), (1, 1, 0));
        assert_eq!(overview.description, "add films");

        vcs.rename_branch("schema-updates/films", "schema-updates/movies").unwrap();
        let branches = vcs.list_branches().unwrap();
        assert_eq!(branches, vec!["main", "schema-updates/movies"]);

        let link = vcs.raise_pull_request("schema-updates/movies", "main", "").unwrap();
        assert_eq!(link, "https://git.example.com/compare/main...schema-updates/movies");

        let remote_repo = Repository::open_bare(&remote).unwrap();
        assert!(remote_repo.find_reference("refs/heads/schema-updates/movies").is_ok());
        assert!(remote_repo.find_reference("refs/heads/schema-updates/films").is_err());
    }

    #[test]
    fn test_pull_request_requires_hosting_url() {
        let vcs = Git2VersionControl::new("file:///nowhere", "/nowhere", None);
        assert!(matches!(
            vcs.raise_pull_request("b", "main", ""),
            Err(SchemaError::Configuration(_))
        ));
    }
}
