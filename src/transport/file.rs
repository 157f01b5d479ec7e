//! Filesystem package loader

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::descriptor::{ProjectDescriptor, PROJECT_DESCRIPTOR_FILE};
use super::writer::FileSystemPackageWriter;
use super::{SchemaPackageTransport, PACKAGE_CHANNEL_CAPACITY};
use crate::config::FileConfig;
use crate::error::{Result, SchemaError};
use crate::source::{PackageIdentifier, SourcePackage, VersionedSource};
use crate::watch::{self, FileChange, FileSystemMonitor};

/// Loads one project directory as a single package.
///
/// The whole tree is re-read on every relevant change batch, so the emitted
/// package always reflects the directory as a whole.
pub struct FileSystemPackageLoader {
    inner: Arc<LoaderState>,
}

struct LoaderState {
    project_root: PathBuf,
    editable: bool,
    suffixes: Vec<String>,
    excluded: Vec<String>,
    monitor: Option<Box<dyn FileSystemMonitor>>,
    sender: Mutex<Option<mpsc::Sender<SourcePackage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    identifier: RwLock<Option<PackageIdentifier>>,
}

impl FileSystemPackageLoader {
    /// Loader with the change detection configured in `config`
    pub fn new(project_root: impl Into<PathBuf>, config: &FileConfig, editable: bool) -> Self {
        let project_root = project_root.into();
        let monitor = watch::monitor_for(project_root.clone(), config);
        Self::with_monitor(project_root, config, editable, Some(monitor))
    }

    /// Loader that only reloads when asked to
    pub fn unwatched(project_root: impl Into<PathBuf>, config: &FileConfig) -> Self {
        Self::with_monitor(project_root.into(), config, false, None)
    }

    pub fn with_monitor(
        project_root: PathBuf,
        config: &FileConfig,
        editable: bool,
        monitor: Option<Box<dyn FileSystemMonitor>>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderState {
                project_root,
                editable,
                suffixes: config.suffixes.clone(),
                excluded: config.excluded_directories.clone(),
                monitor,
                sender: Mutex::new(None),
                task: Mutex::new(None),
                identifier: RwLock::new(None),
            }),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.inner.project_root
    }

    /// Read the project from disk now
    pub fn load_now(&self) -> Result<SourcePackage> {
        self.inner.load()
    }

    /// Re-read the project and emit it to the started stream, if any
    pub async fn reload(&self) -> Result<SourcePackage> {
        LoaderState::reload(&self.inner).await
    }

    /// Writer for the project's source directory.
    ///
    /// Fails for read-only projects, and for projects without a descriptor
    /// since edits need a declared package identity.
    pub fn writer(&self) -> Result<FileSystemPackageWriter> {
        if !self.inner.editable {
            return Err(SchemaError::NotEditable(self.inner.project_root.display().to_string()));
        }
        let descriptor = ProjectDescriptor::load(&self.inner.project_root)?.ok_or_else(|| {
            SchemaError::Configuration(format!(
                "{} has no {}; a project descriptor is required for edits",
                self.inner.project_root.display(),
                PROJECT_DESCRIPTOR_FILE
            ))
        })?;
        Ok(FileSystemPackageWriter::new(
            descriptor.source_dir(&self.inner.project_root),
        ))
    }

    /// Paths of every source file the loader would read
    pub fn source_paths(&self) -> Result<Vec<PathBuf>> {
        let descriptor = self.inner.descriptor()?;
        Ok(self.inner.walk(&descriptor.source_dir(&self.inner.project_root)))
    }
}

impl LoaderState {
    fn descriptor(&self) -> Result<ProjectDescriptor> {
        Ok(ProjectDescriptor::load(&self.project_root)?
            .unwrap_or_else(|| ProjectDescriptor::implicit(&self.project_root)))
    }

    fn has_suffix(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.suffixes.iter().any(|s| ext == s.as_str()))
            .unwrap_or(false)
    }

    /// Whether a change to `path` can affect the loaded package
    fn is_relevant(&self, change: &FileChange) -> bool {
        change.path.file_name().map(|n| n == PROJECT_DESCRIPTOR_FILE).unwrap_or(false)
            || self.has_suffix(&change.path)
            || change.path.extension().is_none()
    }

    fn walk(&self, source_dir: &Path) -> Vec<PathBuf> {
        let excluded = self.excluded.clone();
        let mut paths: Vec<PathBuf> = WalkBuilder::new(source_dir)
            .hidden(false)
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                !excluded.iter().any(|e| name == e.as_str())
            })
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.into_path())
            .filter(|path| self.has_suffix(path))
            .collect();
        paths.sort();
        paths
    }

    fn load(&self) -> Result<SourcePackage> {
        let descriptor = self.descriptor()?;
        let identifier = descriptor.identifier()?;
        let source_dir = descriptor.source_dir(&self.project_root);

        let mut sources = Vec::new();
        for path in self.walk(&source_dir) {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read source, skipping");
                    continue;
                }
            };
            sources.push(VersionedSource::new(
                source_name(&source_dir, &path),
                identifier.version.clone(),
                content,
            ));
        }

        let mut package = SourcePackage::new(identifier.clone(), sources);
        package.metadata.dependencies = descriptor.dependency_identifiers()?;
        debug!(package = %identifier, sources = package.sources.len(), "Loaded project");
        *self.identifier.write() = Some(identifier);
        Ok(package)
    }

    async fn reload(state: &Arc<Self>) -> Result<SourcePackage> {
        let loader = Arc::clone(state);
        let package = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| SchemaError::Transport(format!("load task failed: {}", e)))??;

        let sender = state.sender.lock().clone();
        if let Some(sender) = sender {
            if sender.send(package.clone()).await.is_err() {
                debug!(root = %state.project_root.display(), "Package stream closed");
            }
        }
        Ok(package)
    }

    fn resolve_file_uri(&self, uri: &Url) -> Result<PathBuf> {
        if uri.scheme() != "file" {
            return Err(SchemaError::Transport(format!("unsupported uri scheme: {}", uri)));
        }
        let path = uri
            .to_file_path()
            .map_err(|_| SchemaError::Transport(format!("not a file path: {}", uri)))?;
        let root = std::fs::canonicalize(&self.project_root)?;
        let path = std::fs::canonicalize(&path).map_err(|_| SchemaError::PackageNotFound(uri.to_string()))?;
        if !path.starts_with(&root) {
            return Err(SchemaError::PackageNotFound(uri.to_string()));
        }
        Ok(path)
    }
}

/// `/`-separated name relative to the source directory
fn source_name(source_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(source_dir).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl SchemaPackageTransport for FileSystemPackageLoader {
    fn description(&self) -> String {
        format!("FileSystemPackageLoader at {}", self.inner.project_root.display())
    }

    async fn start(&self) -> Result<mpsc::Receiver<SourcePackage>> {
        self.stop();
        let (tx, rx) = mpsc::channel(PACKAGE_CHANNEL_CAPACITY);
        *self.inner.sender.lock() = Some(tx);

        if let Err(e) = LoaderState::reload(&self.inner).await {
            warn!(root = %self.inner.project_root.display(), error = %e, "Initial load failed");
        }

        if let Some(monitor) = &self.inner.monitor {
            let mut batches = monitor.start_watching()?;
            let state = Arc::clone(&self.inner);
            let task = tokio::spawn(async move {
                while let Some(batch) = batches.recv().await {
                    if !batch.iter().any(|change| state.is_relevant(change)) {
                        continue;
                    }
                    info!(
                        root = %state.project_root.display(),
                        changes = batch.len(),
                        "Detected changes, reloading"
                    );
                    if let Err(e) = LoaderState::reload(&state).await {
                        warn!(root = %state.project_root.display(), error = %e, "Reload failed");
                    }
                    if state.sender.lock().as_ref().map(|s| s.is_closed()).unwrap_or(true) {
                        break;
                    }
                }
            });
            *self.inner.task.lock() = Some(task);
        }
        info!(root = %self.inner.project_root.display(), "Started filesystem loader");
        Ok(rx)
    }

    async fn list_uris(&self) -> Result<Vec<Url>> {
        let state = Arc::clone(&self.inner);
        let paths = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let descriptor = state.descriptor()?;
            Ok(state.walk(&descriptor.source_dir(&state.project_root)))
        })
        .await
        .map_err(|e| SchemaError::Transport(format!("listing failed: {}", e)))??;

        paths
            .iter()
            .map(|path| {
                let absolute = std::fs::canonicalize(path)?;
                Url::from_file_path(&absolute)
                    .map_err(|_| SchemaError::Transport(format!("cannot express {} as a uri", absolute.display())))
            })
            .collect()
    }

    async fn read_uri(&self, uri: &Url) -> Result<Vec<u8>> {
        let path = self.inner.resolve_file_uri(uri)?;
        Ok(tokio::fs::read(path).await?)
    }

    fn is_editable(&self) -> bool {
        self.inner.editable
    }

    fn package_identifier(&self) -> Option<PackageIdentifier> {
        if let Some(identifier) = self.inner.identifier.read().clone() {
            return Some(identifier);
        }
        self.inner.descriptor().and_then(|d| d.identifier()).ok()
    }

    fn stop(&self) {
        if let Some(monitor) = &self.inner.monitor {
            monitor.stop();
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.sender.lock().take();
    }
}

impl Drop for FileSystemPackageLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangeDetectionMethod;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn project(dir: &Path) {
        fs::write(
            dir.join(PROJECT_DESCRIPTOR_FILE),
            "name = \"com.acme/films\"\nversion = \"0.1.0\"\nsource_root = \"src/\"\n",
        )
        .unwrap();
        fs::create_dir_all(dir.join("src/people")).unwrap();
        fs::write(dir.join("src/film.taxi"), "type FilmId inherits String").unwrap();
        fs::write(dir.join("src/people/names.taxi"), "type FirstName inherits String").unwrap();
        fs::write(dir.join("src/notes.md"), "not a source").unwrap();
    }

    fn polling_config() -> FileConfig {
        FileConfig {
            change_detection: ChangeDetectionMethod::Poll,
            poll_interval_ms: 20,
            debounce_ms: 20,
            ..FileConfig::default()
        }
    }

    #[test]
    fn test_load_now_reads_sources() {
        let dir = TempDir::new().unwrap();
        project(dir.path());
        let loader = FileSystemPackageLoader::unwatched(dir.path(), &FileConfig::default());

        let package = loader.load_now().unwrap();
        assert_eq!(package.identifier().id(), "com.acme/films/0.1.0");
        let names: Vec<&str> = package.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["film.taxi", "people/names.taxi"]);
        assert!(package.sources.iter().all(|s| s.version == "0.1.0"));
        assert_eq!(loader.package_identifier().unwrap().unversioned_id(), "com.acme/films");
    }

    #[test]
    fn test_load_without_descriptor() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.taxi"), "type A inherits String").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("stray.taxi"), "type B").unwrap();

        let loader = FileSystemPackageLoader::unwatched(dir.path(), &FileConfig::default());
        let package = loader.load_now().unwrap();
        assert_eq!(package.identifier().organisation, "local");
        assert_eq!(package.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_read_uri_stays_inside_project() {
        let dir = TempDir::new().unwrap();
        project(dir.path());
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.taxi"), "type Secret").unwrap();

        let loader = FileSystemPackageLoader::unwatched(dir.path(), &FileConfig::default());
        let uris = loader.list_uris().await.unwrap();
        assert_eq!(uris.len(), 2);
        let content = loader.read_uri(&uris[0]).await.unwrap();
        assert_eq!(content, b"type FilmId inherits String");

        let escaped = Url::from_file_path(outside.path().join("secret.taxi")).unwrap();
        assert!(matches!(
            loader.read_uri(&escaped).await,
            Err(SchemaError::PackageNotFound(_))
        ));
    }

    #[test]
    fn test_writer_requires_editable_project() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.taxi"), "type A").unwrap();

        let read_only = FileSystemPackageLoader::unwatched(dir.path(), &FileConfig::default());
        assert!(matches!(read_only.writer(), Err(SchemaError::NotEditable(_))));

        let no_descriptor = FileSystemPackageLoader::with_monitor(
            dir.path().to_path_buf(),
            &FileConfig::default(),
            true,
            None,
        );
        assert!(matches!(no_descriptor.writer(), Err(SchemaError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_start_emits_initial_and_changed_packages() {
        let dir = TempDir::new().unwrap();
        project(dir.path());
        let loader = FileSystemPackageLoader::new(dir.path(), &polling_config(), false);

        let mut packages = loader.start().await.unwrap();
        let initial = packages.recv().await.unwrap();
        assert_eq!(initial.sources.len(), 2);

        fs::write(dir.path().join("src/extra.taxi"), "type Extra inherits String").unwrap();
        let updated = tokio::time::timeout(Duration::from_secs(10), packages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.sources.len(), 3);
        loader.stop();
    }
}
