//! Actor owning the registry
//!
//! Transports, publishers and the liveness monitor all talk to the registry
//! through a [`SchemaStore`] handle. Requests queue in one mailbox and are
//! applied one at a time by a single task, which runs compilation on the
//! blocking pool.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::aggregator::{Aggregator, Applied};
use super::notifier::{SchemaNotifier, SchemaSubscription};
use super::{SchemaSet, SubmissionResult};
use crate::changelog::{ChangeLog, ChangeLogDiffFactory, ChangeLogEntry};
use crate::compiler::CompilerAdapter;
use crate::error::{Result, SchemaError};
use crate::source::{PackageIdentifier, PublisherHealth, SourcePackage, VersionedSource};

const MAILBOX_CAPACITY: usize = 256;

/// Settings for [`SchemaStore::spawn`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub compiler: CompilerAdapter,
    pub diff_factory: ChangeLogDiffFactory,
    pub changelog_max_entries: usize,
    pub notification_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compiler: CompilerAdapter::default(),
            diff_factory: ChangeLogDiffFactory::default(),
            changelog_max_entries: 100,
            notification_capacity: 64,
        }
    }
}

enum Command {
    Submit {
        package: SourcePackage,
        reply: oneshot::Sender<SubmissionResult>,
    },
    Remove {
        identifiers: Vec<PackageIdentifier>,
        reply: oneshot::Sender<Arc<SchemaSet>>,
    },
    UpdateHealth {
        identifiers: Vec<PackageIdentifier>,
        health: PublisherHealth,
        reply: oneshot::Sender<Arc<SchemaSet>>,
    },
}

/// Cloneable handle to the registry actor
#[derive(Debug, Clone)]
pub struct SchemaStore {
    commands: mpsc::Sender<Command>,
    notifier: SchemaNotifier,
    changelog: Arc<ChangeLog>,
}

impl SchemaStore {
    /// Start the registry actor on the current tokio runtime.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn(options: StoreOptions) -> Self {
        let (commands, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let notifier = SchemaNotifier::new(options.notification_capacity);
        let changelog = Arc::new(ChangeLog::new(options.changelog_max_entries));
        let aggregator = Aggregator::new(options.compiler, options.diff_factory);

        tokio::spawn(run(aggregator, inbox, notifier.clone(), Arc::clone(&changelog)));

        Self {
            commands,
            notifier,
            changelog,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SchemaError::StoreClosed)?;
        response.await.map_err(|_| SchemaError::StoreClosed)
    }

    /// Submit a package. Compilation errors are returned in the result.
    pub async fn submit(&self, package: SourcePackage) -> Result<SubmissionResult> {
        self.request(|reply| Command::Submit { package, reply }).await
    }

    pub async fn remove(&self, identifiers: Vec<PackageIdentifier>) -> Result<Arc<SchemaSet>> {
        self.request(|reply| Command::Remove { identifiers, reply }).await
    }

    pub async fn update_health(
        &self,
        identifiers: Vec<PackageIdentifier>,
        health: PublisherHealth,
    ) -> Result<Arc<SchemaSet>> {
        self.request(|reply| Command::UpdateHealth {
            identifiers,
            health,
            reply,
        })
        .await
    }

    /// Latest complete snapshot
    pub fn current(&self) -> Arc<SchemaSet> {
        self.notifier.current()
    }

    pub fn subscribe(&self) -> SchemaSubscription {
        self.notifier.subscribe()
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    /// Most recent first
    pub fn changelog_entries(&self) -> Vec<ChangeLogEntry> {
        self.changelog.entries()
    }

    /// Every source currently registered
    pub fn raw_sources(&self) -> Vec<VersionedSource> {
        self.current().all_sources()
    }
}

async fn run(
    mut aggregator: Aggregator,
    mut inbox: mpsc::Receiver<Command>,
    notifier: SchemaNotifier,
    changelog: Arc<ChangeLog>,
) {
    debug!("Schema store started");
    while let Some(command) = inbox.recv().await {
        // The aggregator moves onto the blocking pool for the duration of
        // the command and comes back with the result.
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = match &command {
                Command::Submit { package, .. } => Outcome::Applied(aggregator.submit(package.clone())),
                Command::Remove { identifiers, .. } => Outcome::Applied(aggregator.remove(identifiers)),
                Command::UpdateHealth {
                    identifiers, health, ..
                } => Outcome::Health(aggregator.update_health(identifiers, health.clone())),
            };
            (aggregator, command, outcome)
        })
        .await;

        let (returned, command, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Schema store task failed, shutting down");
                return;
            }
        };
        aggregator = returned;
        let current = aggregator.current();

        let changed = match &outcome {
            Outcome::Applied(applied) => applied.changed,
            Outcome::Health(updated) => *updated,
        };
        if changed {
            notifier.publish(Arc::clone(&current));
        }
        if let Outcome::Applied(Applied {
            changelog: Some(entry), ..
        }) = &outcome
        {
            info!(diffs = entry.diffs.len(), generation = current.generation, "Recorded changelog entry");
            changelog.append(entry.clone());
        }

        // A caller that stopped waiting is not an error
        match (command, outcome) {
            (Command::Submit { reply, .. }, Outcome::Applied(applied)) => {
                let _ = reply.send(SubmissionResult {
                    errors: applied.errors,
                    schema_set: current,
                });
            }
            (Command::Remove { reply, .. }, _) | (Command::UpdateHealth { reply, .. }, _) => {
                let _ = reply.send(current);
            }
            (Command::Submit { .. }, Outcome::Health(_)) => {}
        }
    }
    debug!("Schema store stopped");
}

enum Outcome {
    Applied(Applied),
    Health(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::DiffKind;

    fn package(name: &str, content: &str) -> SourcePackage {
        SourcePackage::new(
            PackageIdentifier::new("com.acme", name, "0.1.0"),
            vec![VersionedSource::new(format!("{}.taxi", name), "0.1.0", content)],
        )
    }

    #[tokio::test]
    async fn test_submit_notifies_subscribers() {
        let store = SchemaStore::spawn(StoreOptions::default());
        let mut subscription = store.subscribe();
        assert_eq!(subscription.recv().await.unwrap().generation, 0);

        let result = store
            .submit(package("names", "type FirstName inherits String"))
            .await
            .unwrap();
        assert!(result.is_valid());
        assert_eq!(result.schema_set.generation, 1);
        assert_eq!(subscription.recv().await.unwrap().generation, 1);
        assert_eq!(store.current().generation, 1);
    }

    #[tokio::test]
    async fn test_broken_submission_still_notifies() {
        let store = SchemaStore::spawn(StoreOptions::default());
        let mut subscription = store.subscribe();
        subscription.recv().await;

        let result = store.submit(package("films", "model Film {")).await.unwrap();
        assert!(!result.is_valid());
        let notified = subscription.recv().await.unwrap();
        assert_eq!(notified.invalid_packages().count(), 1);
    }

    #[tokio::test]
    async fn test_changelog_recorded() {
        let store = SchemaStore::spawn(StoreOptions::default());
        store
            .submit(package("names", "type FirstName inherits String"))
            .await
            .unwrap();
        let entries = store.changelog_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].diffs[0].kind, DiffKind::TypeAdded);
        assert_eq!(store.raw_sources().len(), 1);
    }
}
