//! Schema Registry
//!
//! Holds the current [`SchemaSet`]: every known package, compiled, plus the
//! schema merged from the valid ones. All mutation goes through a single
//! writer ([`SchemaStore`]); readers only ever see complete snapshots.

mod aggregator;
mod notifier;
mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compiler::CompilationMessage;
use crate::schema::Schema;
use crate::source::{PackageIdentifier, ParsedPackage, VersionedSource};

pub use aggregator::{Aggregator, Applied};
pub use notifier::{SchemaNotifier, SchemaSubscription};
pub use store::{SchemaStore, StoreOptions};

/// An immutable snapshot of the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSet {
    /// Increases on every accepted mutation
    pub generation: u64,
    /// All packages, valid or not, ordered by unversioned id
    pub packages: Vec<ParsedPackage>,
    /// Merged from the valid packages only
    pub schema: Schema,
}

impl SchemaSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn valid_packages(&self) -> impl Iterator<Item = &ParsedPackage> {
        self.packages.iter().filter(|p| p.is_valid())
    }

    pub fn invalid_packages(&self) -> impl Iterator<Item = &ParsedPackage> {
        self.packages.iter().filter(|p| !p.is_valid())
    }

    /// Find a package by identifier, ignoring the version
    pub fn package(&self, identifier: &PackageIdentifier) -> Option<&ParsedPackage> {
        let unversioned = identifier.unversioned_id();
        self.packages
            .iter()
            .find(|p| p.identifier().unversioned_id() == unversioned)
    }

    /// Every source of every package
    pub fn all_sources(&self) -> Vec<VersionedSource> {
        self.packages
            .iter()
            .flat_map(|p| p.source_package.sources.iter().cloned())
            .collect()
    }

    pub fn errors(&self) -> Vec<CompilationMessage> {
        self.packages.iter().flat_map(|p| p.errors().cloned()).collect()
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        format!(
            "generation {}: {} packages ({} invalid), {} types, {} services",
            self.generation,
            self.packages.len(),
            self.invalid_packages().count(),
            self.schema.types.len(),
            self.schema.services.len()
        )
    }
}

/// Outcome of a submission: the diagnostics for the submitted package, and
/// the schema set after it was applied.
///
/// A submission with compilation errors still produces a result; the errors
/// are data, not a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub errors: Vec<CompilationMessage>,
    pub schema_set: Arc<SchemaSet>,
}

impl SubmissionResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
