//! Package transports
//!
//! A transport turns some external source of schema files into a stream of
//! [`SourcePackage`]s. Every implementation conforms to
//! [`SchemaPackageTransport`]:
//!
//! - [`FileSystemPackageLoader`] reads a directory tree and reloads it on change
//! - [`GitSchemaPackageLoader`] owns a filesystem loader over a local checkout
//!   and adds periodic sync plus branch-backed changesets
//! - [`PushSubmissionEndpoint`] accepts packages submitted by publishers
//!
//! Background failures inside a transport (fetch errors, unreadable files) are
//! logged and skipped. They never reach the registry.

mod descriptor;
mod file;
pub mod git;
mod push;
mod writer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;
use crate::source::{PackageIdentifier, SourcePackage};

pub use descriptor::{ProjectDescriptor, PROJECT_DESCRIPTOR_FILE};
pub use file::FileSystemPackageLoader;
pub use git::GitSchemaPackageLoader;
pub use push::{PushSubmission, PushSubmissionEndpoint};
pub use writer::FileSystemPackageWriter;

/// Capacity of the package channel returned by [`SchemaPackageTransport::start`]
pub(crate) const PACKAGE_CHANNEL_CAPACITY: usize = 32;

/// Common contract of every package source
#[async_trait]
pub trait SchemaPackageTransport: Send + Sync {
    /// Human readable description for logs
    fn description(&self) -> String;

    /// Begin emitting packages.
    ///
    /// Loaders emit their current package immediately, then one package per
    /// detected change. The stream ends when the transport is stopped.
    async fn start(&self) -> Result<mpsc::Receiver<SourcePackage>>;

    /// URIs of every source this transport currently exposes
    async fn list_uris(&self) -> Result<Vec<Url>>;

    /// Contents of a URI returned by [`list_uris`](Self::list_uris)
    async fn read_uri(&self, uri: &Url) -> Result<Vec<u8>>;

    fn is_editable(&self) -> bool;

    /// Identifier of the package this transport loads, when there is exactly one
    fn package_identifier(&self) -> Option<PackageIdentifier>;

    /// Cancel background work and release watch handles
    fn stop(&self);
}

/// A named, branch-backed unit of pending edits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    pub package_identifier: PackageIdentifier,
}

/// Changesets of a package with the active one marked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableChangesets {
    pub changesets: Vec<Changeset>,
}

impl AvailableChangesets {
    pub fn active(&self) -> Option<&Changeset> {
        self.changesets.iter().find(|c| c.is_active)
    }
}
