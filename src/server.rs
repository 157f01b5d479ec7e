//! Schema server assembly
//!
//! Builds every configured transport, starts them, and forwards the
//! packages they emit into the [`SchemaStore`]. Push submissions go to the
//! store directly through the [`PushSubmissionEndpoint`], which also applies
//! the lost-publisher policy for the keep-alive monitor.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::changelog::ChangeLogDiffFactory;
use crate::config::SchemaServerConfig;
use crate::error::{Result, SchemaError};
use crate::keepalive::{HttpLivenessProbe, KeepAliveMonitor};
use crate::registry::{SchemaStore, StoreOptions};
use crate::source::SourcePackage;
use crate::transport::{
    FileSystemPackageLoader, GitSchemaPackageLoader, PushSubmissionEndpoint, SchemaPackageTransport,
};

pub struct SchemaServer {
    store: SchemaStore,
    file_loaders: Vec<Arc<FileSystemPackageLoader>>,
    git_loaders: Vec<Arc<GitSchemaPackageLoader>>,
    push: Arc<PushSubmissionEndpoint>,
    monitor: KeepAliveMonitor,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchemaServer {
    /// Build the server from configuration. Must run inside a tokio runtime.
    pub fn new(config: &SchemaServerConfig) -> Result<Self> {
        let store = SchemaStore::spawn(StoreOptions {
            diff_factory: ChangeLogDiffFactory::new(config.changelog.excluded_namespaces.clone())
                .with_type_details(config.changelog.include_type_details),
            changelog_max_entries: config.changelog.max_entries,
            ..StoreOptions::default()
        });

        let file_loaders = config
            .file
            .projects
            .iter()
            .map(|project| {
                Arc::new(FileSystemPackageLoader::new(
                    SchemaServerConfig::resolve_path(&project.path),
                    &config.file,
                    project.editable,
                ))
            })
            .collect();

        let git_loaders = config
            .git
            .repositories
            .iter()
            .map(|repository| {
                Arc::new(GitSchemaPackageLoader::new(
                    repository.clone(),
                    config.checkout_dir(repository),
                    &config.git,
                    &config.file,
                ))
            })
            .collect();

        let probe = Arc::new(HttpLivenessProbe::new(config.keep_alive.probe_timeout())?);
        let monitor = KeepAliveMonitor::new(probe, &config.keep_alive);
        let push = Arc::new(PushSubmissionEndpoint::new(
            store.clone(),
            monitor.clone(),
            config.publishers.lost_policy,
        ));

        Ok(Self {
            store,
            file_loaders,
            git_loaders,
            push,
            monitor,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    pub fn push_endpoint(&self) -> &Arc<PushSubmissionEndpoint> {
        &self.push
    }

    pub fn file_loaders(&self) -> &[Arc<FileSystemPackageLoader>] {
        &self.file_loaders
    }

    pub fn git_loaders(&self) -> &[Arc<GitSchemaPackageLoader>] {
        &self.git_loaders
    }

    fn loaders(&self) -> Vec<Arc<dyn SchemaPackageTransport>> {
        let files = self
            .file_loaders
            .iter()
            .map(|l| Arc::clone(l) as Arc<dyn SchemaPackageTransport>);
        let git = self
            .git_loaders
            .iter()
            .map(|l| Arc::clone(l) as Arc<dyn SchemaPackageTransport>);
        files.chain(git).collect()
    }

    /// Start every transport and the keep-alive monitor.
    ///
    /// A transport that fails to start is logged and skipped.
    pub async fn start(&self) -> Result<()> {
        for loader in self.loaders() {
            match loader.start().await {
                Ok(packages) => {
                    let task = tokio::spawn(forward(loader.description(), packages, self.store.clone()));
                    self.tasks.lock().push(task);
                }
                Err(e) => error!(transport = %loader.description(), error = %e, "Failed to start transport"),
            }
        }

        let mut accepted = self.push.start().await?;
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(package) = accepted.recv().await {
                debug!(package = %package.identifier(), "Push submission accepted");
            }
        }));
        self.monitor.start();
        info!(
            file_loaders = self.file_loaders.len(),
            git_loaders = self.git_loaders.len(),
            "Schema server started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        for loader in self.loaders() {
            loader.stop();
        }
        self.push.stop();
        self.monitor.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Schema server stopped");
    }

    /// URIs of every source across all transports
    pub async fn list_uris(&self) -> Result<Vec<Url>> {
        let mut uris = Vec::new();
        for loader in self.loaders() {
            match loader.list_uris().await {
                Ok(found) => uris.extend(found),
                Err(e) => warn!(transport = %loader.description(), error = %e, "Failed to list sources"),
            }
        }
        uris.extend(self.push.list_uris().await?);
        Ok(uris)
    }
}

/// Submit each package from a loader, in order
async fn forward(description: String, mut packages: mpsc::Receiver<SourcePackage>, store: SchemaStore) {
    while let Some(package) = packages.recv().await {
        let identifier = package.identifier().clone();
        match store.submit(package).await {
            Ok(result) if result.is_valid() => {
                debug!(transport = %description, package = %identifier, "Package accepted");
            }
            Ok(result) => {
                for message in &result.errors {
                    warn!(transport = %description, package = %identifier, "{}", message);
                }
            }
            Err(SchemaError::StoreClosed) => break,
            Err(e) => warn!(transport = %description, package = %identifier, error = %e, "Submission failed"),
        }
    }
    debug!(transport = %description, "Package stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChangeDetectionMethod, FileProjectConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_projects_reach_the_store() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("names.taxi"), "type FirstName inherits String").unwrap();

        let mut config = SchemaServerConfig::default();
        config.file.change_detection = ChangeDetectionMethod::Poll;
        config.file.poll_interval_ms = 20;
        config.file.debounce_ms = 20;
        config.file.projects.push(FileProjectConfig {
            path: dir.path().to_path_buf(),
            editable: false,
        });

        let server = SchemaServer::new(&config).unwrap();
        let mut subscription = server.store().subscribe();
        server.start().await.unwrap();

        let schema_set = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match subscription.recv().await {
                    Some(set) if set.generation > 0 => return set,
                    Some(_) => continue,
                    None => panic!("store closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(schema_set.schema.has_type("FirstName"));
        assert_eq!(server.list_uris().await.unwrap().len(), 1);
        server.stop();
    }
}
