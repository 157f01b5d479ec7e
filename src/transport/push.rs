//! Push submission endpoint
//!
//! Publishers submit packages directly instead of being polled. A submission
//! may carry a [`PublisherConfiguration`]; such packages are tracked per
//! publisher so they can be marked unhealthy (or removed) when the
//! [`KeepAliveMonitor`] reports the publisher lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{SchemaPackageTransport, PACKAGE_CHANNEL_CAPACITY};
use crate::config::PublisherLostPolicy;
use crate::error::{Result, SchemaError};
use crate::keepalive::{ConnectionId, KeepAliveMonitor, KeepAliveStrategy, PublisherConfiguration};
use crate::registry::{SchemaStore, SubmissionResult};
use crate::source::{HealthStatus, PackageIdentifier, PublisherHealth, SourcePackage};

const PUSH_SCHEME: &str = "push";
const PUSH_HOST: &str = "packages";

/// A package plus, optionally, who published it and how to check on them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubmission {
    pub package: SourcePackage,
    #[serde(default)]
    pub publisher: Option<PublisherConfiguration>,
}

impl PushSubmission {
    pub fn anonymous(package: SourcePackage) -> Self {
        Self {
            package,
            publisher: None,
        }
    }

    pub fn from_publisher(package: SourcePackage, publisher: PublisherConfiguration) -> Self {
        Self {
            package,
            publisher: Some(publisher),
        }
    }
}

/// Which packages came from where, keyed by unversioned id
#[derive(Default)]
struct Publishers {
    by_publisher: HashMap<String, BTreeMap<String, PackageIdentifier>>,
    anonymous: BTreeMap<String, PackageIdentifier>,
    connections: HashMap<ConnectionId, String>,
}

impl Publishers {
    fn record(&mut self, publisher_id: Option<&str>, identifier: &PackageIdentifier) {
        let key = identifier.unversioned_id();
        // A package has one owner; the latest submitter wins
        self.anonymous.remove(&key);
        for packages in self.by_publisher.values_mut() {
            packages.remove(&key);
        }
        match publisher_id {
            Some(id) => {
                self.by_publisher
                    .entry(id.to_string())
                    .or_default()
                    .insert(key, identifier.clone());
            }
            None => {
                self.anonymous.insert(key, identifier.clone());
            }
        }
    }

    fn packages_of(&self, publisher_id: &str) -> Vec<PackageIdentifier> {
        self.by_publisher
            .get(publisher_id)
            .map(|packages| packages.values().cloned().collect())
            .unwrap_or_default()
    }

    fn contains(&self, unversioned_id: &str) -> bool {
        self.anonymous.contains_key(unversioned_id)
            || self.by_publisher.values().any(|p| p.contains_key(unversioned_id))
    }
}

pub struct PushSubmissionEndpoint {
    inner: Arc<EndpointState>,
}

struct EndpointState {
    store: SchemaStore,
    monitor: KeepAliveMonitor,
    lost_policy: PublisherLostPolicy,
    publishers: RwLock<Publishers>,
    sender: Mutex<Option<mpsc::Sender<SourcePackage>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PushSubmissionEndpoint {
    pub fn new(store: SchemaStore, monitor: KeepAliveMonitor, lost_policy: PublisherLostPolicy) -> Self {
        Self {
            inner: Arc::new(EndpointState {
                store,
                monitor,
                lost_policy,
                publishers: RwLock::new(Publishers::default()),
                sender: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn monitor(&self) -> &KeepAliveMonitor {
        &self.inner.monitor
    }

    /// Submit a package, optionally on behalf of a publisher.
    ///
    /// Publishers submitting this way are recorded and count as seen. A
    /// publisher that registered a keep-alive earlier stays monitored.
    pub async fn submit(&self, package: SourcePackage, publisher_id: Option<&str>) -> Result<SubmissionResult> {
        let submission = PushSubmission {
            package,
            publisher: publisher_id.map(|id| PublisherConfiguration::new(id, KeepAliveStrategy::None)),
        };
        self.submit_with_keep_alive(submission).await
    }

    pub async fn submit_with_keep_alive(&self, submission: PushSubmission) -> Result<SubmissionResult> {
        EndpointState::submit(&self.inner, submission).await
    }

    /// Register a new transport connection
    pub fn open_connection(&self) -> ConnectionId {
        let connection_id = format!("conn-{}", Uuid::new_v4());
        info!(connection = %connection_id, "Opened publisher connection");
        connection_id
    }

    /// Submit over a connection. Publishers without their own keep-alive
    /// strategy are bound to the connection and lost when it closes.
    pub async fn submit_over_connection(
        &self,
        connection_id: &str,
        mut submission: PushSubmission,
    ) -> Result<SubmissionResult> {
        if let Some(publisher) = submission.publisher.as_mut() {
            self.inner
                .publishers
                .write()
                .connections
                .insert(connection_id.to_string(), publisher.publisher_id.clone());
            if !publisher.keep_alive.is_monitored() {
                publisher.keep_alive = KeepAliveStrategy::Connection {
                    connection_id: connection_id.to_string(),
                };
            }
        }
        self.submit_with_keep_alive(submission).await
    }

    /// Transport callback: the connection is gone
    pub async fn connection_closed(&self, connection_id: &str) {
        let publisher = self.inner.publishers.write().connections.remove(connection_id);
        info!(connection = %connection_id, publisher = ?publisher, "Publisher connection closed");
        for lost in self.inner.monitor.connection_closed(connection_id) {
            EndpointState::publisher_lost(&self.inner, &lost).await;
        }
    }

    /// Packages last submitted by a publisher
    pub fn packages_of(&self, publisher_id: &str) -> Vec<PackageIdentifier> {
        self.inner.publishers.read().packages_of(publisher_id)
    }

    /// Apply the lost-publisher policy
    pub async fn publisher_lost(&self, publisher: &PublisherConfiguration) {
        EndpointState::publisher_lost(&self.inner, publisher).await
    }
}

impl EndpointState {
    async fn submit(state: &Arc<Self>, submission: PushSubmission) -> Result<SubmissionResult> {
        let identifier = submission.package.identifier().clone();
        let publisher_id = submission.publisher.as_ref().map(|p| p.publisher_id.clone());
        info!(package = %identifier, publisher = ?publisher_id, "Received push submission");

        state.publishers.write().record(publisher_id.as_deref(), &identifier);
        match submission.publisher {
            Some(publisher) if publisher.keep_alive.is_monitored() => state.monitor.monitor(publisher),
            // No strategy given: keep whatever the publisher registered earlier
            Some(publisher) => {
                state.monitor.ping(&publisher.publisher_id);
            }
            None => {}
        }

        let package = submission.package;
        let mirror = state.sender.lock().clone();
        if let Some(sender) = mirror {
            if sender.try_send(package.clone()).is_err() {
                debug!(package = %identifier, "Package stream full or closed");
            }
        }

        let mut result = state.store.submit(package).await?;

        // Identical resubmissions are no-ops, so a recovered publisher's
        // health has to be restored explicitly
        let unhealthy = result
            .schema_set
            .package(&identifier)
            .map(|p| p.health.status != HealthStatus::Healthy)
            .unwrap_or(false);
        if unhealthy {
            result.schema_set = state
                .store
                .update_health(vec![identifier], PublisherHealth::healthy())
                .await?;
        }
        Ok(result)
    }

    async fn publisher_lost(state: &Arc<Self>, publisher: &PublisherConfiguration) {
        let packages = state.publishers.read().packages_of(&publisher.publisher_id);
        if packages.is_empty() {
            debug!(publisher = %publisher.publisher_id, "Lost publisher had no packages");
            return;
        }

        let outcome = match state.lost_policy {
            PublisherLostPolicy::MarkUnhealthy => {
                let message = format!("Publisher {} is no longer reachable", publisher.publisher_id);
                state
                    .store
                    .update_health(packages.clone(), PublisherHealth::unhealthy(message))
                    .await
            }
            PublisherLostPolicy::Remove => {
                state.publishers.write().by_publisher.remove(&publisher.publisher_id);
                state.store.remove(packages.clone()).await
            }
        };
        match outcome {
            Ok(schema_set) => info!(
                publisher = %publisher.publisher_id,
                packages = packages.len(),
                policy = ?state.lost_policy,
                generation = schema_set.generation,
                "Applied lost publisher policy"
            ),
            Err(e) => warn!(publisher = %publisher.publisher_id, error = %e, "Failed to apply lost publisher policy"),
        }
    }

    fn submitted_packages(&self) -> Vec<SourcePackage> {
        let publishers = self.publishers.read();
        self.store
            .current()
            .packages
            .iter()
            .filter(|p| publishers.contains(&p.identifier().unversioned_id()))
            .map(|p| p.source_package.clone())
            .collect()
    }
}

fn source_uri(identifier: &PackageIdentifier, source_name: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{}://{}/", PUSH_SCHEME, PUSH_HOST))?;
    url.path_segments_mut()
        .map_err(|_| SchemaError::Transport(format!("cannot build {} uri", PUSH_SCHEME)))?
        .clear()
        .push(&identifier.uri_safe_id())
        .extend(source_name.split('/'));
    Ok(url)
}

#[async_trait]
impl SchemaPackageTransport for PushSubmissionEndpoint {
    fn description(&self) -> String {
        "PushSubmissionEndpoint".to_string()
    }

    /// Mirrors accepted submissions, and starts applying the lost-publisher
    /// policy to monitor terminations. Submissions reach the registry
    /// directly; the stream is for observers.
    async fn start(&self) -> Result<mpsc::Receiver<SourcePackage>> {
        self.stop();
        let (tx, rx) = mpsc::channel(PACKAGE_CHANNEL_CAPACITY);
        *self.inner.sender.lock() = Some(tx);

        let mut terminated = self.inner.monitor.terminated();
        let state = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            loop {
                match terminated.recv().await {
                    Ok(publisher) => EndpointState::publisher_lost(&state, &publisher).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed publisher terminations");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.inner.listener.lock() = Some(listener);
        Ok(rx)
    }

    async fn list_uris(&self) -> Result<Vec<Url>> {
        let mut uris = Vec::new();
        for package in self.inner.submitted_packages() {
            for source in &package.sources {
                uris.push(source_uri(package.identifier(), &source.name)?);
            }
        }
        Ok(uris)
    }

    async fn read_uri(&self, uri: &Url) -> Result<Vec<u8>> {
        for package in self.inner.submitted_packages() {
            for source in &package.sources {
                if source_uri(package.identifier(), &source.name)? == *uri {
                    return Ok(source.content.clone().into_bytes());
                }
            }
        }
        Err(SchemaError::PackageNotFound(uri.to_string()))
    }

    fn is_editable(&self) -> bool {
        false
    }

    fn package_identifier(&self) -> Option<PackageIdentifier> {
        None
    }

    fn stop(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::LivenessProbe;
    use crate::registry::StoreOptions;
    use crate::source::VersionedSource;
    use std::time::Duration;

    struct DeadProbe;

    #[async_trait]
    impl LivenessProbe for DeadProbe {
        async fn probe(&self, url: &Url) -> Result<()> {
            Err(SchemaError::Transport(format!("{} unreachable", url)))
        }
    }

    fn endpoint(policy: PublisherLostPolicy) -> PushSubmissionEndpoint {
        let store = SchemaStore::spawn(StoreOptions::default());
        let monitor = KeepAliveMonitor::with_timing(Arc::new(DeadProbe), Duration::from_secs(1), Duration::from_secs(1));
        PushSubmissionEndpoint::new(store, monitor, policy)
    }

    fn names_package() -> SourcePackage {
        SourcePackage::new(
            PackageIdentifier::new("com.acme", "names", "1.0.0"),
            vec![VersionedSource::new(
                "people/names.taxi",
                "1.0.0",
                "type FirstName inherits String",
            )],
        )
    }

    #[tokio::test]
    async fn test_submit_returns_schema_set() {
        let endpoint = endpoint(PublisherLostPolicy::MarkUnhealthy);
        let result = endpoint.submit(names_package(), Some("names-service")).await.unwrap();
        assert!(result.is_valid());
        assert!(result.schema_set.schema.has_type("FirstName"));
        assert_eq!(endpoint.packages_of("names-service").len(), 1);
        assert!(!endpoint.monitor().is_monitored("names-service"));
    }

    #[tokio::test]
    async fn test_plain_resubmission_keeps_keep_alive() {
        let endpoint = endpoint(PublisherLostPolicy::MarkUnhealthy);
        let polled = PublisherConfiguration::new(
            "names-service",
            KeepAliveStrategy::http_poll(Url::parse("http://names.local/ping").unwrap(), Duration::from_secs(5)),
        );
        endpoint
            .submit_with_keep_alive(PushSubmission::from_publisher(names_package(), polled))
            .await
            .unwrap();
        assert!(endpoint.monitor().is_monitored("names-service"));
        let registered = endpoint.monitor().last_ping("names-service").unwrap();

        endpoint.submit(names_package(), Some("names-service")).await.unwrap();
        assert!(endpoint.monitor().is_monitored("names-service"));
        assert!(endpoint.monitor().last_ping("names-service").unwrap() >= registered);
        assert_eq!(endpoint.packages_of("names-service").len(), 1);
    }

    #[tokio::test]
    async fn test_uris_round_trip() {
        let endpoint = endpoint(PublisherLostPolicy::MarkUnhealthy);
        endpoint.submit(names_package(), None).await.unwrap();

        let uris = endpoint.list_uris().await.unwrap();
        assert_eq!(uris.len(), 1);
        assert_eq!(uris[0].scheme(), "push");
        assert_eq!(uris[0].path(), "/com.acme:names:1.0.0/people/names.taxi");
        assert_eq!(
            endpoint.read_uri(&uris[0]).await.unwrap(),
            b"type FirstName inherits String"
        );
    }

    #[tokio::test]
    async fn test_closed_connection_marks_packages_unhealthy() {
        let endpoint = endpoint(PublisherLostPolicy::MarkUnhealthy);
        let connection = endpoint.open_connection();
        endpoint
            .submit_over_connection(
                &connection,
                PushSubmission::from_publisher(
                    names_package(),
                    PublisherConfiguration::new("names-service", KeepAliveStrategy::None),
                ),
            )
            .await
            .unwrap();
        assert!(endpoint.monitor().is_monitored("names-service"));

        endpoint.connection_closed(&connection).await;
        let schema_set = endpoint.inner.store.current();
        let package = schema_set.package(names_package().identifier()).unwrap();
        assert_eq!(package.health.status, HealthStatus::Unhealthy);
        assert!(schema_set.schema.has_type("FirstName"));

        // Resubmitting identical content restores health
        let result = endpoint.submit(names_package(), Some("names-service")).await.unwrap();
        let package = result.schema_set.package(names_package().identifier()).unwrap();
        assert_eq!(package.health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_remove_policy_evicts_packages() {
        let endpoint = endpoint(PublisherLostPolicy::Remove);
        endpoint.submit(names_package(), Some("names-service")).await.unwrap();

        endpoint
            .publisher_lost(&PublisherConfiguration::new("names-service", KeepAliveStrategy::None))
            .await;
        let schema_set = endpoint.inner.store.current();
        assert!(schema_set.packages.is_empty());
        assert!(!schema_set.schema.has_type("FirstName"));
        assert!(endpoint.packages_of("names-service").is_empty());
    }
}
