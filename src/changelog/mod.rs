//! Schema changelog
//!
//! Every accepted schema transition that changes at least one member is
//! recorded as a [`ChangeLogEntry`] holding a tree of diffs.

mod diff;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::schema::QualifiedName;
use crate::source::PackageIdentifier;

pub use diff::{ChangeLogDiffFactory, DEFAULT_EXCLUDED_NAMESPACES};

/// Kind of change a diff entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    TypeAdded,
    TypeRemoved,
    ModelAdded,
    ModelRemoved,
    ModelChanged,
    FieldAddedToModel,
    FieldRemovedFromModel,
    DocumentationChanged,
    MetadataChanged,
    ServiceAdded,
    ServiceRemoved,
    ServiceChanged,
    OperationAdded,
    OperationRemoved,
    OperationMetadataChanged,
    OperationParametersChanged,
    OperationReturnValueChanged,
}

/// One node of a diff tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogDiffEntry {
    pub display_name: String,
    pub kind: DiffKind,
    pub schema_member: QualifiedName,
    #[serde(default)]
    pub children: Vec<ChangeLogDiffEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_details: Option<serde_json::Value>,
}

impl ChangeLogDiffEntry {
    pub fn new(display_name: impl Into<String>, kind: DiffKind, schema_member: QualifiedName) -> Self {
        Self {
            display_name: display_name.into(),
            kind,
            schema_member,
            children: Vec::new(),
            old_details: None,
            new_details: None,
        }
    }

    pub fn with_children(mut self, children: Vec<ChangeLogDiffEntry>) -> Self {
        self.children = children;
        self
    }

    pub fn with_details(mut self, old: Option<serde_json::Value>, new: Option<serde_json::Value>) -> Self {
        self.old_details = old;
        self.new_details = new;
        self
    }
}

/// A recorded schema transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub affected_packages: Vec<PackageIdentifier>,
    pub diffs: Vec<ChangeLogDiffEntry>,
}

/// Bounded in-memory history of changelog entries
#[derive(Debug)]
pub struct ChangeLog {
    max_entries: usize,
    entries: RwLock<VecDeque<ChangeLogEntry>>,
}

impl ChangeLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Record a transition; entries without diffs are dropped
    pub fn append(&self, entry: ChangeLogEntry) -> bool {
        if entry.diffs.is_empty() {
            return false;
        }
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        true
    }

    /// Most recent first
    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.entries.read().iter().rev().cloned().collect()
    }

    pub fn latest(&self) -> Option<ChangeLogEntry> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ChangeLogEntry {
        ChangeLogEntry {
            timestamp: Utc::now(),
            affected_packages: vec![PackageIdentifier::new("com.acme", "names", "0.1.0")],
            diffs: vec![ChangeLogDiffEntry::new(name, DiffKind::TypeAdded, QualifiedName::new(name))],
        }
    }

    #[test]
    fn test_entries_most_recent_first() {
        let log = ChangeLog::new(10);
        log.append(entry("A"));
        log.append(entry("B"));
        let names: Vec<_> = log.entries().iter().map(|e| e.diffs[0].display_name.clone()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_bounded_history() {
        let log = ChangeLog::new(2);
        for name in ["A", "B", "C"] {
            log.append(entry(name));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries().last().unwrap().diffs[0].display_name, "B");
    }

    #[test]
    fn test_empty_diffs_are_not_recorded() {
        let log = ChangeLog::new(2);
        let mut empty = entry("A");
        empty.diffs.clear();
        assert!(!log.append(empty));
        assert!(log.is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ChangeLogDiffEntry::new(
            "FirstName",
            DiffKind::TypeAdded,
            QualifiedName::new("FirstName"),
        ))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "displayName": "FirstName",
                "kind": "TypeAdded",
                "schemaMember": "FirstName",
                "children": []
            })
        );
    }
}
