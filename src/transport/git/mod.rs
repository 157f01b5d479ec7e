//! Version-controlled package loader
//!
//! Owns a [`FileSystemPackageLoader`] pointed at a local checkout and keeps
//! the checkout in sync with the remote on a timer. Edits happen on branches
//! ("changesets"): each changeset is a branch named with the configured
//! prefix, and activating one checks it out and resynchronizes the package.

mod operations;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use super::{AvailableChangesets, Changeset, FileSystemPackageLoader, SchemaPackageTransport};
use crate::config::{FileConfig, GitConfig, GitRepositoryConfig};
use crate::error::{Result, SchemaError};
use crate::source::{PackageIdentifier, SourcePackage, VersionedSource};
use crate::watch;

pub use operations::{ChangesetOverview, Git2VersionControl, VersionControl};

/// Result of raising a pull request for a changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedChangeset {
    pub changeset: Changeset,
    pub overview: ChangesetOverview,
    pub link: String,
}

pub struct GitSchemaPackageLoader {
    inner: Arc<GitLoaderState>,
}

struct GitLoaderState {
    config: GitRepositoryConfig,
    working_dir: PathBuf,
    files: FileSystemPackageLoader,
    vcs: Arc<dyn VersionControl>,
    current_branch: RwLock<String>,
    poll_frequency: Duration,
    operation_timeout: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Project directory inside the checkout. Absolute configured paths are
/// treated as relative to the checkout root.
fn project_dir(working_dir: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    working_dir.join(relative)
}

impl GitSchemaPackageLoader {
    /// Loader backed by libgit2, checking out into `working_dir`
    pub fn new(config: GitRepositoryConfig, working_dir: PathBuf, git: &GitConfig, files: &FileConfig) -> Self {
        let vcs = Arc::new(Git2VersionControl::new(
            config.uri.clone(),
            working_dir.clone(),
            config.pull_request.hosting_url_template.clone(),
        ));

        let mut file_config = files.clone();
        if !file_config.excluded_directories.iter().any(|d| d == ".git") {
            file_config.excluded_directories.push(".git".to_string());
        }
        let monitor = watch::monitor_for(working_dir.clone(), &file_config);
        let loader = FileSystemPackageLoader::with_monitor(
            project_dir(&working_dir, &config.path),
            &file_config,
            config.editable,
            Some(monitor),
        );
        Self::with_version_control(config, working_dir, loader, vcs, git.poll_frequency(), git.operation_timeout())
    }

    pub fn with_version_control(
        config: GitRepositoryConfig,
        working_dir: PathBuf,
        files: FileSystemPackageLoader,
        vcs: Arc<dyn VersionControl>,
        poll_frequency: Duration,
        operation_timeout: Duration,
    ) -> Self {
        let current_branch = RwLock::new(config.branch.clone());
        Self {
            inner: Arc::new(GitLoaderState {
                config,
                working_dir,
                files,
                vcs,
                current_branch,
                poll_frequency,
                operation_timeout,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    pub fn current_branch(&self) -> String {
        self.inner.current_branch.read().clone()
    }

    pub fn default_branch(&self) -> &str {
        &self.inner.config.branch
    }

    /// Fetch and check out the current branch now.
    ///
    /// Failures are logged. A failing changeset branch reverts the loader to
    /// the default branch. Returns whether the sync succeeded.
    pub async fn sync_now(&self) -> bool {
        GitLoaderState::sync_now(&self.inner).await
    }

    fn prefix(&self) -> &str {
        &self.inner.config.pull_request.branch_prefix
    }

    /// Branch backing the changeset `name`
    fn resolve_branch_name(&self, name: &str) -> String {
        if name == self.default_branch() {
            name.to_string()
        } else {
            format!("{}{}", self.prefix(), name)
        }
    }

    /// Changeset name of a branch
    fn changeset_name<'a>(&self, branch: &'a str) -> &'a str {
        if branch == self.default_branch() {
            branch
        } else {
            branch.strip_prefix(self.prefix()).unwrap_or(branch)
        }
    }

    fn changeset(&self, name: &str, is_active: bool) -> Result<Changeset> {
        Ok(Changeset {
            name: name.to_string(),
            is_active,
            is_default: name == self.default_branch(),
            package_identifier: self.identifier()?,
        })
    }

    fn identifier(&self) -> Result<PackageIdentifier> {
        self.inner
            .files
            .package_identifier()
            .ok_or_else(|| SchemaError::PackageNotFound(self.inner.config.name.clone()))
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.inner.config.editable {
            Ok(())
        } else {
            Err(SchemaError::NotEditable(self.inner.config.name.clone()))
        }
    }

    /// Create a changeset branch from the current branch and switch to it
    pub async fn create_changeset(&self, name: &str) -> Result<Changeset> {
        self.ensure_editable()?;
        let branch = self.resolve_branch_name(name);
        let target = branch.clone();
        self.inner
            .run("create branch", move |vcs| vcs.create_branch(&target))
            .await?;
        *self.inner.current_branch.write() = branch;
        self.changeset(name, true)
    }

    /// Write edits into the checkout, then commit and push them to the active
    /// changeset
    pub async fn add_changes_to_changeset(&self, name: &str, edits: Vec<VersionedSource>) -> Result<ChangesetOverview> {
        self.ensure_editable()?;
        let branch = self.current_branch();
        if branch == self.default_branch() {
            return Err(SchemaError::Configuration(format!(
                "changes to {} must be made on a changeset, not the default branch",
                self.inner.config.name
            )));
        }
        let writer = self.inner.files.writer()?;
        let message = name.to_string();
        self.inner
            .run("commit", move |vcs| {
                writer.write_sources(&edits)?;
                vcs.commit_and_push(&message)
            })
            .await?;

        if let Err(e) = self.inner.files.reload().await {
            warn!(repo = %self.inner.config.name, error = %e, "Reload after commit failed");
        }
        self.overview(branch).await
    }

    /// Push the active changeset and return a review link
    pub async fn finalize_changeset(&self, name: &str) -> Result<FinalizedChangeset> {
        let branch = self.resolve_branch_name(name);
        let base = self.default_branch().to_string();
        let (pr_branch, pr_base) = (branch.clone(), base.clone());
        let link = self
            .inner
            .run("raise pull request", move |vcs| vcs.raise_pull_request(&pr_branch, &pr_base, ""))
            .await?;
        Ok(FinalizedChangeset {
            changeset: self.changeset(name, true)?,
            overview: self.overview(branch).await?,
            link,
        })
    }

    /// Rename the active changeset
    pub async fn update_changeset(&self, name: &str, new_name: &str) -> Result<Changeset> {
        self.ensure_editable()?;
        let from = self.current_branch();
        if from == self.default_branch() {
            return Err(SchemaError::Configuration(format!(
                "the default branch of {} cannot be renamed",
                self.inner.config.name
            )));
        }
        let to = self.resolve_branch_name(new_name);
        info!(changeset = name, branch = %from, new_branch = %to, "Renaming changeset");
        let (rename_from, rename_to) = (from.clone(), to.clone());
        self.inner
            .run("rename branch", move |vcs| vcs.rename_branch(&rename_from, &rename_to))
            .await?;
        *self.inner.current_branch.write() = to;
        self.changeset(new_name, true)
    }

    /// Changesets on the prefix, plus the default branch, with the active one marked
    pub async fn available_changesets(&self) -> Result<AvailableChangesets> {
        let branches = self.inner.run("list branches", |vcs| vcs.list_branches()).await?;
        let current = self.current_branch();
        let active = self.changeset_name(&current).to_string();

        let mut names: Vec<String> = branches
            .iter()
            .filter_map(|b| b.strip_prefix(self.prefix()))
            .filter(|name| !name.is_empty() && *name != self.default_branch())
            .map(String::from)
            .collect();
        names.push(self.default_branch().to_string());

        let changesets = names
            .iter()
            .map(|name| self.changeset(name, *name == active))
            .collect::<Result<Vec<_>>>()?;
        Ok(AvailableChangesets { changesets })
    }

    /// Switch to a changeset and resynchronize the package from it
    pub async fn set_active_changeset(&self, name: &str) -> Result<(Changeset, ChangesetOverview)> {
        let branch = self.resolve_branch_name(name);
        info!(repo = %self.inner.config.name, branch = %branch, "Activating changeset");
        *self.inner.current_branch.write() = branch.clone();
        if !self.sync_now().await {
            return Err(SchemaError::Transport(format!(
                "could not check out changeset '{}'",
                name
            )));
        }
        self.inner.files.reload().await?;
        Ok((self.changeset(name, true)?, self.overview(branch).await?))
    }

    async fn overview(&self, branch: String) -> Result<ChangesetOverview> {
        let base = self.default_branch().to_string();
        self.inner
            .run("changeset overview", move |vcs| vcs.changeset_overview(&branch, &base))
            .await
    }
}

impl GitLoaderState {
    fn description(&self) -> String {
        format!(
            "{} - {} / {}",
            self.config.name,
            self.config.uri,
            self.current_branch.read()
        )
    }

    /// Run a blocking version control operation with the operation timeout
    async fn run<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VersionControl) -> Result<T> + Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        let task = tokio::task::spawn_blocking(move || f(vcs.as_ref()));
        match tokio::time::timeout(self.operation_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SchemaError::Transport(format!("{} failed: {}", operation, e))),
            Err(_) => Err(SchemaError::Timeout {
                operation: operation.to_string(),
                timeout: self.operation_timeout,
            }),
        }
    }

    async fn sync_now(state: &Arc<Self>) -> bool {
        info!(repo = %state.description(), "Starting git sync");
        let branch = state.current_branch.read().clone();
        let target = branch.clone();
        let result = state.run("fetch", move |vcs| vcs.fetch_latest(&target)).await;

        let succeeded = match result {
            Ok(changed) => {
                if changed {
                    if let Err(e) = state.files.reload().await {
                        warn!(repo = %state.config.name, error = %e, "Reload after sync failed");
                    }
                }
                true
            }
            Err(e) => {
                warn!(repo = %state.description(), error = %e, "Git sync failed");
                if branch != state.config.branch {
                    info!(
                        repo = %state.config.name,
                        branch = %branch,
                        default = %state.config.branch,
                        "Reverting to default branch after failed sync"
                    );
                    *state.current_branch.write() = state.config.branch.clone();
                }
                false
            }
        };
        info!(repo = %state.description(), "Finished git sync");
        succeeded
    }
}

#[async_trait]
impl SchemaPackageTransport for GitSchemaPackageLoader {
    fn description(&self) -> String {
        format!("GitLoader at {}", self.inner.description())
    }

    async fn start(&self) -> Result<mpsc::Receiver<SourcePackage>> {
        self.stop();
        self.sync_now().await;
        let packages = self.inner.files.start().await?;

        let state = Arc::clone(&self.inner);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.poll_frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                GitLoaderState::sync_now(&state).await;
            }
        });
        *self.inner.ticker.lock() = Some(ticker);
        Ok(packages)
    }

    async fn list_uris(&self) -> Result<Vec<Url>> {
        let working_dir = std::fs::canonicalize(&self.inner.working_dir)?;
        let git_dir = working_dir.join(".git");
        let uris = self.inner.files.list_uris().await?;
        Ok(uris
            .into_iter()
            .filter(|uri| match uri.to_file_path() {
                Ok(path) => !path.starts_with(&git_dir) && path != working_dir,
                Err(_) => false,
            })
            .collect())
    }

    async fn read_uri(&self, uri: &Url) -> Result<Vec<u8>> {
        self.inner.files.read_uri(uri).await
    }

    fn is_editable(&self) -> bool {
        self.inner.config.editable
    }

    fn package_identifier(&self) -> Option<PackageIdentifier> {
        self.inner.files.package_identifier()
    }

    fn stop(&self) {
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
        self.inner.files.stop();
    }
}

impl Drop for GitSchemaPackageLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::operations::tests::remote_with_main;
    use super::*;
    use crate::config::PullRequestConfig;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = "name = \"com.acme/films\"\nversion = \"0.1.0\"\nsource_root = \"src/\"\n";

    fn loader(dir: &Path, remote: &Path) -> GitSchemaPackageLoader {
        let config = GitRepositoryConfig {
            name: "films".into(),
            uri: remote.to_str().unwrap().into(),
            branch: "main".into(),
            path: PathBuf::from("/"),
            editable: true,
            pull_request: PullRequestConfig {
                branch_prefix: "schema-updates/".into(),
                hosting_url_template: Some("https://git.example.com/{base}...{branch}".into()),
            },
        };
        let working_dir = dir.join("checkouts/films");
        let vcs = Arc::new(Git2VersionControl::new(
            config.uri.clone(),
            working_dir.clone(),
            config.pull_request.hosting_url_template.clone(),
        ));
        let files = FileSystemPackageLoader::with_monitor(
            project_dir(&working_dir, &config.path),
            &FileConfig::default(),
            true,
            None,
        );
        GitSchemaPackageLoader::with_version_control(
            config,
            working_dir,
            files,
            vcs,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_project_dir_strips_root() {
        assert_eq!(project_dir(Path::new("/co"), Path::new("/schemas")), PathBuf::from("/co/schemas"));
        assert_eq!(project_dir(Path::new("/co"), Path::new("")), PathBuf::from("/co"));
    }

    #[tokio::test]
    async fn test_start_emits_checked_out_package() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(
            dir.path(),
            &[("taxi.toml", DESCRIPTOR), ("src/names.taxi", "type FirstName inherits String")],
        );
        let loader = loader(dir.path(), &remote);

        let mut packages = loader.start().await.unwrap();
        let package = packages.recv().await.unwrap();
        assert_eq!(package.identifier().id(), "com.acme/films/0.1.0");
        assert_eq!(package.sources.len(), 1);

        let uris = loader.list_uris().await.unwrap();
        assert_eq!(uris.len(), 1);
        assert!(uris.iter().all(|u| !u.path().contains("/.git/")));
        loader.stop();
    }

    #[tokio::test]
    async fn test_changeset_lifecycle() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(
            dir.path(),
            &[("taxi.toml", DESCRIPTOR), ("src/names.taxi", "type FirstName inherits String")],
        );
        let loader = loader(dir.path(), &remote);
        assert!(loader.sync_now().await);

        let changeset = loader.create_changeset("add-films").await.unwrap();
        assert!(changeset.is_active);
        assert_eq!(loader.current_branch(), "schema-updates/add-films");

        let overview = loader
            .add_changes_to_changeset(
                "add film id",
                vec![VersionedSource::unversioned("film.taxi", "type FilmId inherits String")],
            )
            .await
            .unwrap();
        assert_eq!(overview.additions, 1);

        let available = loader.available_changesets().await.unwrap();
        let names: Vec<&str> = available.changesets.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["add-films", "main"]);
        assert_eq!(available.active().unwrap().name, "add-films");
        assert!(available.changesets[1].is_default);

        let renamed = loader.update_changeset("add-films", "films").await.unwrap();
        assert_eq!(renamed.name, "films");
        assert_eq!(loader.current_branch(), "schema-updates/films");

        let finalized = loader.finalize_changeset("films").await.unwrap();
        assert_eq!(finalized.link, "https://git.example.com/main...schema-updates/films");

        let (active, _) = loader.set_active_changeset("main").await.unwrap();
        assert!(active.is_default);
        let package = loader.inner.files.load_now().unwrap();
        assert_eq!(package.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_reverts_to_default_branch() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(dir.path(), &[("taxi.toml", DESCRIPTOR), ("src/a.taxi", "type A")]);
        let loader = loader(dir.path(), &remote);
        assert!(loader.sync_now().await);

        assert!(loader.set_active_changeset("missing").await.is_err());
        assert_eq!(loader.current_branch(), "main");
    }

    #[tokio::test]
    async fn test_default_branch_is_read_only() {
        let dir = TempDir::new().unwrap();
        let remote = remote_with_main(dir.path(), &[("taxi.toml", DESCRIPTOR), ("src/a.taxi", "type A")]);
        let loader = loader(dir.path(), &remote);
        assert!(loader.sync_now().await);

        let result = loader
            .add_changes_to_changeset("direct", vec![VersionedSource::unversioned("b.taxi", "type B")])
            .await;
        assert!(matches!(result, Err(SchemaError::Configuration(_))));
        assert!(matches!(
            loader.update_changeset("main", "other").await,
            Err(SchemaError::Configuration(_))
        ));
    }
}
