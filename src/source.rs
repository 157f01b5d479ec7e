//! Source model
//!
//! Immutable value types exchanged between transports, the compiler and the
//! schema store: versioned sources, packages of sources, and packages after
//! compilation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::compiler::{CompilationMessage, Severity};
use crate::error::{Result, SchemaError};
use crate::schema::Document;
use crate::version::PackageVersion;

/// A single source file. Identity is `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedSource {
    /// Path-like name, relative to the package's source root
    pub name: String,
    pub version: String,
    pub content: String,
}

impl VersionedSource {
    pub fn new(name: impl Into<String>, version: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            content: content.into(),
        }
    }

    /// Source without a meaningful version, as sent by editors
    pub fn unversioned(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(name, "0.0.0", content)
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    pub fn content_hash(&self) -> Checksum {
        Checksum::of_content(&self.content)
    }
}

/// Global identity of a package across all transports
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIdentifier {
    pub organisation: String,
    pub name: String,
    pub version: String,
}

const URI_SAFE_SEPARATOR: char = ':';

impl PackageIdentifier {
    pub fn new(organisation: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            organisation: organisation.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// `org/name`, stable across versions
    pub fn unversioned_id(&self) -> String {
        format!("{}/{}", self.organisation, self.name)
    }

    /// `org/name/version`
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.organisation, self.name, self.version)
    }

    /// `org:name:version`, usable as a single path segment
    pub fn uri_safe_id(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.organisation,
            self.name,
            self.version,
            sep = URI_SAFE_SEPARATOR
        )
    }

    /// Parse a slash delimited id, e.g. `com.acme/films/1.0.0`
    pub fn from_id(id: &str) -> Result<Self> {
        Self::from_parts(id, '/')
    }

    pub fn from_uri_safe_id(id: &str) -> Result<Self> {
        Self::from_parts(id, URI_SAFE_SEPARATOR)
    }

    fn from_parts(id: &str, separator: char) -> Result<Self> {
        let parts: Vec<&str> = id.split(separator).collect();
        match parts.as_slice() {
            [org, name, version] if !org.is_empty() && !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(*org, *name, *version))
            }
            _ => Err(SchemaError::InvalidIdentifier(format!(
                "'{}' - expected three parts delimited by '{}'",
                id, separator
            ))),
        }
    }

    pub fn parsed_version(&self) -> PackageVersion {
        PackageVersion::parse(&self.version)
    }

    /// Same package, different version
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self::new(self.organisation.clone(), self.name.clone(), version)
    }
}

impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Descriptive data accompanying a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub identifier: PackageIdentifier,
    pub submission_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PackageIdentifier>,
}

impl PackageMetadata {
    pub fn new(identifier: PackageIdentifier) -> Self {
        Self {
            identifier,
            submission_date: Utc::now(),
            dependencies: Vec::new(),
        }
    }
}

/// A named, versioned bundle of sources.
///
/// Packages are replaced whole: a new package for an identifier supersedes
/// the previous one entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePackage {
    pub metadata: PackageMetadata,
    pub sources: Vec<VersionedSource>,
}

impl SourcePackage {
    pub fn new(identifier: PackageIdentifier, sources: Vec<VersionedSource>) -> Self {
        Self {
            metadata: PackageMetadata::new(identifier),
            sources,
        }
    }

    pub fn identifier(&self) -> &PackageIdentifier {
        &self.metadata.identifier
    }

    /// Hash over the name-sorted source hashes; independent of source order
    pub fn content_hash(&self) -> Checksum {
        let per_source: Vec<Checksum> = self
            .sources
            .iter()
            .map(|s| Checksum::of_content(&format!("{}\n{}", s.name, s.content_hash())))
            .collect();
        Checksum::combine(per_source.iter())
    }
}

/// Health of the publisher that contributed a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PublisherHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl Default for PublisherHealth {
    fn default() -> Self {
        Self::healthy()
    }
}

/// A package after compilation.
///
/// A package with entries in `sources_with_errors` contributes nothing to
/// the merged schema, but stays visible for diagnostics until a corrected
/// submission supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPackage {
    pub source_package: SourcePackage,
    /// Members attributable to this package
    pub document: Arc<Document>,
    pub messages: Vec<CompilationMessage>,
    pub sources_with_errors: Vec<String>,
    pub health: PublisherHealth,
}

impl ParsedPackage {
    pub fn new(source_package: SourcePackage, document: Document, messages: Vec<CompilationMessage>) -> Self {
        let mut sources_with_errors: Vec<String> = messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
            .map(|m| m.source_name.clone())
            .collect();
        sources_with_errors.sort();
        sources_with_errors.dedup();
        Self {
            source_package,
            document: Arc::new(document),
            messages,
            sources_with_errors,
            health: PublisherHealth::healthy(),
        }
    }

    pub fn identifier(&self) -> &PackageIdentifier {
        self.source_package.identifier()
    }

    pub fn is_valid(&self) -> bool {
        self.sources_with_errors.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &CompilationMessage> {
        self.messages.iter().filter(|m| m.severity == Severity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_forms() {
        let id = PackageIdentifier::new("com.acme", "films", "0.1.0");
        assert_eq!(id.id(), "com.acme/films/0.1.0");
        assert_eq!(id.unversioned_id(), "com.acme/films");
        assert_eq!(id.uri_safe_id(), "com.acme:films:0.1.0");
        assert_eq!(PackageIdentifier::from_uri_safe_id(&id.uri_safe_id()).unwrap(), id);
        assert_eq!(PackageIdentifier::from_id(&id.id()).unwrap(), id);
    }

    #[test]
    fn test_invalid_identifier() {
        assert!(PackageIdentifier::from_id("com.acme/films").is_err());
        assert!(PackageIdentifier::from_id("a//c").is_err());
    }

    #[test]
    fn test_package_hash_ignores_source_order() {
        let id = PackageIdentifier::new("com.acme", "films", "0.1.0");
        let a = VersionedSource::new("a.taxi", "0.1.0", "type A inherits String");
        let b = VersionedSource::new("b.taxi", "0.1.0", "type B inherits String");
        let first = SourcePackage::new(id.clone(), vec![a.clone(), b.clone()]);
        let second = SourcePackage::new(id, vec![b, a]);
        assert_eq!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn test_package_hash_sees_renames() {
        let id = PackageIdentifier::new("com.acme", "films", "0.1.0");
        let first = SourcePackage::new(id.clone(), vec![VersionedSource::new("a.taxi", "1", "type A")]);
        let second = SourcePackage::new(id, vec![VersionedSource::new("b.taxi", "1", "type A")]);
        assert_ne!(first.content_hash(), second.content_hash());
    }
}
