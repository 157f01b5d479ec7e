//! The registry state machine
//!
//! Packages are keyed by unversioned id, so a new version of a package
//! replaces the old one. Only the affected package is compiled on a change;
//! packages that depend on it are revisited only when the change made a
//! difference to them:
//!
//! - names disappearing from the valid set can break packages that were valid
//! - any change can repair packages that were in error

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::SchemaSet;
use crate::changelog::{ChangeLogDiffFactory, ChangeLogEntry};
use crate::checksum::Checksum;
use crate::compiler::{CompilationMessage, CompilerAdapter};
use crate::schema::{Document, QualifiedName, Schema};
use crate::source::{PackageIdentifier, ParsedPackage, PublisherHealth, SourcePackage};

/// Result of applying one change
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Diagnostics of the submitted package
    pub errors: Vec<CompilationMessage>,
    /// Whether a new snapshot was produced
    pub changed: bool,
    /// Present when the merged schema changed
    pub changelog: Option<ChangeLogEntry>,
}

/// Single-writer registry state
#[derive(Debug)]
pub struct Aggregator {
    compiler: CompilerAdapter,
    diff_factory: ChangeLogDiffFactory,
    packages: BTreeMap<String, ParsedPackage>,
    hashes: BTreeMap<String, Checksum>,
    current: Arc<SchemaSet>,
}

impl Aggregator {
    pub fn new(compiler: CompilerAdapter, diff_factory: ChangeLogDiffFactory) -> Self {
        Self {
            compiler,
            diff_factory,
            packages: BTreeMap::new(),
            hashes: BTreeMap::new(),
            current: Arc::new(SchemaSet::empty()),
        }
    }

    pub fn current(&self) -> Arc<SchemaSet> {
        Arc::clone(&self.current)
    }

    /// Compile and store a package.
    ///
    /// Resubmitting identical content for the same identifier changes
    /// nothing, not even the generation.
    pub fn submit(&mut self, package: SourcePackage) -> Applied {
        let identifier = package.identifier().clone();
        let key = identifier.unversioned_id();
        let hash = package.content_hash();

        if let Some(existing) = self.packages.get(&key) {
            if existing.identifier() == &identifier && self.hashes.get(&key) == Some(&hash) {
                debug!(package = %identifier, "Package unchanged, ignoring submission");
                return Applied {
                    errors: existing.errors().cloned().collect(),
                    ..Applied::default()
                };
            }
        }

        let names_before = self.valid_type_names();
        let parsed = self.compile(&key, package);
        let errors: Vec<CompilationMessage> = parsed.errors().cloned().collect();
        if errors.is_empty() {
            info!(package = %identifier, "Package compiled");
        } else {
            warn!(
                package = %identifier,
                errors = errors.len(),
                sources = ?parsed.sources_with_errors,
                "Package has compilation errors, its members are excluded from the schema"
            );
        }
        self.packages.insert(key.clone(), parsed);
        self.hashes.insert(key, hash);
        self.settle(names_before);

        let changelog = self.commit(vec![identifier]);
        Applied {
            errors,
            changed: true,
            changelog,
        }
    }

    /// Remove packages.
    ///
    /// A removal naming a different version from the one stored is refused,
    /// so a stale removal cannot evict a newer submission.
    pub fn remove(&mut self, identifiers: &[PackageIdentifier]) -> Applied {
        let names_before = self.valid_type_names();
        let mut removed = Vec::new();
        for identifier in identifiers {
            let key = identifier.unversioned_id();
            match self.packages.get(&key) {
                None => warn!(package = %identifier, "Cannot remove package, it is not registered"),
                Some(stored) if stored.identifier() != identifier => warn!(
                    package = %identifier,
                    stored = %stored.identifier(),
                    "Cannot remove package, a different version is registered"
                ),
                Some(_) => {
                    self.packages.remove(&key);
                    self.hashes.remove(&key);
                    removed.push(identifier.clone());
                }
            }
        }
        if removed.is_empty() {
            return Applied::default();
        }
        info!(packages = ?removed.iter().map(|p| p.id()).collect::<Vec<_>>(), "Removed packages");
        self.settle(names_before);
        let changelog = self.commit(removed);
        Applied {
            changed: true,
            changelog,
            ..Applied::default()
        }
    }

    /// Record publisher health on packages.
    ///
    /// Produces a new snapshot with the same generation and schema.
    pub fn update_health(&mut self, identifiers: &[PackageIdentifier], health: PublisherHealth) -> bool {
        let mut updated = false;
        for identifier in identifiers {
            if let Some(package) = self.packages.get_mut(&identifier.unversioned_id()) {
                if package.health.status != health.status || package.health.message != health.message {
                    package.health = health.clone();
                    updated = true;
                }
            }
        }
        if updated {
            self.current = Arc::new(SchemaSet {
                generation: self.current.generation,
                packages: self.packages.values().cloned().collect(),
                schema: self.current.schema.clone(),
            });
        }
        updated
    }

    fn context_for(&self, key: &str) -> Vec<Arc<Document>> {
        self.packages
            .iter()
            .filter(|(k, p)| k.as_str() != key && p.is_valid())
            .map(|(_, p)| Arc::clone(&p.document))
            .collect()
    }

    fn compile(&self, key: &str, package: SourcePackage) -> ParsedPackage {
        let context = self.context_for(key);
        self.compiler.validate(&context, package)
    }

    fn valid_type_names(&self) -> BTreeSet<QualifiedName> {
        self.packages
            .values()
            .filter(|p| p.is_valid())
            .flat_map(|p| p.document.types.iter().map(|t| t.name.clone()))
            .collect()
    }

    /// Recompile one stored package against the current context; true when
    /// its validity flipped
    fn revalidate(&mut self, key: &str) -> bool {
        let Some(existing) = self.packages.get(key) else {
            return false;
        };
        let was_valid = existing.is_valid();
        let health = existing.health.clone();
        let mut parsed = self.compile(key, existing.source_package.clone());
        parsed.health = health;
        let flipped = parsed.is_valid() != was_valid;
        if flipped {
            debug!(package = %parsed.identifier(), valid = parsed.is_valid(), "Package validity changed");
        }
        self.packages.insert(key.to_string(), parsed);
        flipped
    }

    fn settle(&mut self, mut names_before: BTreeSet<QualifiedName>) {
        // Bounded: each pass flips at least one package
        for _ in 0..=self.packages.len() {
            let mut progress = false;
            let names_now = self.valid_type_names();

            // Short names resolve against the whole context, so a name that
            // appears can make a valid package ambiguous just as a name that
            // disappears can leave it unresolved
            if names_before != names_now {
                let valid: Vec<String> = self
                    .packages
                    .iter()
                    .filter(|(_, p)| p.is_valid())
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in valid {
                    progress |= self.revalidate(&key);
                }
            }

            let invalid: Vec<String> = self
                .packages
                .iter()
                .filter(|(_, p)| !p.is_valid())
                .map(|(k, _)| k.clone())
                .collect();
            for key in invalid {
                progress |= self.revalidate(&key);
            }

            if !progress {
                return;
            }
            names_before = names_now;
        }
        warn!("Package revalidation did not settle");
    }

    fn commit(&mut self, affected: Vec<PackageIdentifier>) -> Option<ChangeLogEntry> {
        let merged = Schema::merge(
            self.packages
                .values()
                .filter(|p| p.is_valid())
                .map(|p| p.document.as_ref()),
        );
        let schema = self.current.schema.share_unchanged(merged);
        let diffs = self.diff_factory.build_diffs(&self.current.schema, &schema);

        self.current = Arc::new(SchemaSet {
            generation: self.current.generation + 1,
            packages: self.packages.values().cloned().collect(),
            schema,
        });
        info!(diffs = diffs.len(), "Schema set updated to {}", self.current.summary());

        (!diffs.is_empty()).then(|| ChangeLogEntry {
            timestamp: Utc::now(),
            affected_packages: affected,
            diffs,
        })
    }
}
