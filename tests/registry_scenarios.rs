//! End-to-end registry scenarios
//!
//! Drives the store through the public API the way transports do, and checks
//! the schema, diagnostics, changelog and publisher health that come out.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use schema_server::config::{FileConfig, PublisherLostPolicy};
use schema_server::keepalive::{KeepAliveMonitor, KeepAliveStrategy, LivenessProbe, PublisherConfiguration};
use schema_server::source::HealthStatus;
use schema_server::transport::{FileSystemPackageLoader, PushSubmission, PushSubmissionEndpoint, SchemaPackageTransport};
use schema_server::{
    DiffKind, PackageIdentifier, Result, SchemaError, SchemaStore, SourcePackage, StoreOptions, VersionedSource,
};
use tempfile::TempDir;
use url::Url;

fn package(name: &str, version: &str, files: &[(&str, &str)]) -> SourcePackage {
    SourcePackage::new(
        PackageIdentifier::new("com.acme", name, version),
        files
            .iter()
            .map(|(file, content)| VersionedSource::new(*file, version, *content))
            .collect(),
    )
}

// =============================================================================
// Changelog
// =============================================================================

#[tokio::test]
async fn test_changelog_describes_each_accepted_transition() {
    let store = SchemaStore::spawn(StoreOptions::default());

    store
        .submit(package("people", "0.1.0", &[("names.taxi", "type FirstName inherits String")]))
        .await
        .unwrap();
    let entries = store.changelog_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].diffs.len(), 1);
    assert_eq!(entries[0].diffs[0].kind, DiffKind::TypeAdded);
    assert_eq!(entries[0].diffs[0].display_name, "FirstName");

    store
        .submit(package(
            "people",
            "0.2.0",
            &[
                ("names.taxi", "type FirstName inherits String"),
                ("person.taxi", "model Person {\n  firstName : FirstName\n  age : Int\n}"),
            ],
        ))
        .await
        .unwrap();
    let entries = store.changelog_entries();
    assert_eq!(entries.len(), 2);

    let latest = &entries[0];
    assert_eq!(latest.affected_packages.len(), 1);
    assert_eq!(latest.diffs.len(), 1);
    let person = &latest.diffs[0];
    assert_eq!(person.kind, DiffKind::ModelAdded);
    assert_eq!(person.display_name, "Person");
    let mut fields: Vec<(&str, DiffKind)> = person
        .children
        .iter()
        .map(|child| (child.display_name.as_str(), child.kind))
        .collect();
    fields.sort_by_key(|(name, _)| *name);
    assert_eq!(
        fields,
        vec![("age", DiffKind::FieldAddedToModel), ("firstName", DiffKind::FieldAddedToModel)]
    );
}

#[tokio::test]
async fn test_model_package_built_on_another_package() {
    let store = SchemaStore::spawn(StoreOptions::default());
    store
        .submit(package(
            "names",
            "0.1.0",
            &[("names.taxi", "type FirstName inherits String\ntype LastName inherits String")],
        ))
        .await
        .unwrap();

    let result = store
        .submit(package(
            "people",
            "0.1.0",
            &[("person.taxi", "model Person {\n  firstName : FirstName\n  lastName : LastName\n}")],
        ))
        .await
        .unwrap();
    assert!(result.is_valid());

    let entries = store.changelog_entries();
    assert_eq!(entries.len(), 2);
    let latest = &entries[0];
    assert_eq!(
        latest.affected_packages,
        vec![PackageIdentifier::new("com.acme", "people", "0.1.0")]
    );
    assert_eq!(latest.diffs.len(), 1);
    let person = &latest.diffs[0];
    assert_eq!(person.kind, DiffKind::ModelAdded);
    assert_eq!(person.display_name, "Person");
    let mut fields: Vec<(&str, DiffKind)> = person
        .children
        .iter()
        .map(|child| (child.display_name.as_str(), child.kind))
        .collect();
    fields.sort_by_key(|(name, _)| *name);
    assert_eq!(
        fields,
        vec![("firstName", DiffKind::FieldAddedToModel), ("lastName", DiffKind::FieldAddedToModel)]
    );
}

#[tokio::test]
async fn test_broken_new_package_records_nothing() {
    let store = SchemaStore::spawn(StoreOptions::default());
    store
        .submit(package("films", "0.1.0", &[("film.taxi", "type Title inherits String")]))
        .await
        .unwrap();

    let result = store
        .submit(package("reviews", "0.1.0", &[("review.taxi", "model Review { film : Missing }")]))
        .await
        .unwrap();
    assert!(!result.is_valid());
    assert_eq!(result.schema_set.invalid_packages().count(), 1);
    assert_eq!(store.changelog_entries().len(), 1);
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn test_submission_order_does_not_change_schema() {
    let names = package("names", "0.1.0", &[("names.taxi", "type FirstName inherits String")]);
    let people = package("people", "0.1.0", &[("person.taxi", "model Person { firstName : FirstName }")]);
    let films = package("films", "0.1.0", &[("film.taxi", "type Title inherits String")]);

    let forward = SchemaStore::spawn(StoreOptions::default());
    for p in [names.clone(), people.clone(), films.clone()] {
        forward.submit(p).await.unwrap();
    }
    let backward = SchemaStore::spawn(StoreOptions::default());
    for p in [films, people, names] {
        backward.submit(p).await.unwrap();
    }

    let forward = forward.current();
    let backward = backward.current();
    assert_eq!(forward.schema, backward.schema);
    assert!(backward.schema.has_type("Person"));
    assert_eq!(backward.invalid_packages().count(), 0);
}

#[tokio::test]
async fn test_fix_restores_members_of_broken_package() {
    let store = SchemaStore::spawn(StoreOptions::default());
    store
        .submit(package("films", "0.1.0", &[("film.taxi", "type Title inherits String")]))
        .await
        .unwrap();
    store
        .submit(package("people", "0.1.0", &[("names.taxi", "type FirstName inherits String")]))
        .await
        .unwrap();

    let broken = store
        .submit(package("people", "0.2.0", &[("names.taxi", "type FirstName inherits")]))
        .await
        .unwrap();
    assert!(broken.errors.iter().any(|m| m.is_error()));
    assert!(!broken.schema_set.schema.has_type("FirstName"));
    assert!(broken.schema_set.schema.has_type("Title"));

    let fixed = store
        .submit(package("people", "0.3.0", &[("names.taxi", "type FirstName inherits String")]))
        .await
        .unwrap();
    assert!(fixed.is_valid());
    assert!(fixed.schema_set.schema.has_type("FirstName"));
    assert!(fixed.schema_set.generation > broken.schema_set.generation);
}

// =============================================================================
// Push publishers
// =============================================================================

struct UnreachableProbe;

#[async_trait]
impl LivenessProbe for UnreachableProbe {
    async fn probe(&self, url: &Url) -> Result<()> {
        Err(SchemaError::Transport(format!("{} unreachable", url)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_publisher_is_marked_unhealthy() {
    let store = SchemaStore::spawn(StoreOptions::default());
    let monitor = KeepAliveMonitor::with_timing(
        Arc::new(UnreachableProbe),
        Duration::from_secs(1),
        Duration::from_millis(500),
    );
    let endpoint = PushSubmissionEndpoint::new(store.clone(), monitor.clone(), PublisherLostPolicy::MarkUnhealthy);
    let _accepted = endpoint.start().await.unwrap();
    monitor.start();

    let names = package("names", "1.0.0", &[("names.taxi", "type FirstName inherits String")]);
    let identifier = names.identifier().clone();
    let publisher = PublisherConfiguration::new(
        "names-service",
        KeepAliveStrategy::http_poll(Url::parse("http://names.local/ping").unwrap(), Duration::from_secs(5)),
    );
    endpoint
        .submit_with_keep_alive(PushSubmission::from_publisher(names.clone(), publisher))
        .await
        .unwrap();

    let degraded = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let current = store.current();
            let status = current.package(&identifier).map(|p| p.health.status);
            if status == Some(HealthStatus::Unhealthy) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();
    assert!(degraded.schema.has_type("FirstName"));

    let recovered = endpoint.submit(names, Some("names-service")).await.unwrap();
    let package = recovered.schema_set.package(&identifier).unwrap();
    assert_eq!(package.health.status, HealthStatus::Healthy);

    monitor.stop();
    endpoint.stop();
}

// =============================================================================
// Editable file projects
// =============================================================================

#[tokio::test]
async fn test_edits_to_file_project_are_reloaded() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("taxi.toml"), "name = \"com.acme/films\"\nversion = \"0.1.0\"\n").unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/film.taxi"), "type Title inherits String").unwrap();

    let loader = FileSystemPackageLoader::with_monitor(dir.path().to_path_buf(), &FileConfig::default(), true, None);
    let mut packages = loader.start().await.unwrap();
    let initial = packages.recv().await.unwrap();
    assert_eq!(initial.identifier().id(), "com.acme/films/0.1.0");
    assert_eq!(initial.sources.len(), 1);

    let written = loader
        .writer()
        .unwrap()
        .write_sources(&[VersionedSource::unversioned("people/names.taxi", "type FirstName inherits String")])
        .unwrap();
    assert!(written[0].ends_with("src/people/names.taxi"));

    loader.reload().await.unwrap();
    let reloaded = packages.recv().await.unwrap();
    let mut names: Vec<&str> = reloaded.sources.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["film.taxi", "people/names.taxi"]);
    loader.stop();
}
