//! Structural diff between two schema generations

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::{ChangeLogDiffEntry, DiffKind};
use crate::schema::{Operation, QualifiedName, Schema, Service, Type};

/// Namespaces whose members never appear in a changelog
pub const DEFAULT_EXCLUDED_NAMESPACES: [&str; 2] = ["lang.taxi", "io.vyne"];

/// Builds [`ChangeLogDiffEntry`] trees from a pair of schemas
#[derive(Debug, Clone)]
pub struct ChangeLogDiffFactory {
    excluded_namespaces: Vec<String>,
    include_type_details: bool,
}

impl Default for ChangeLogDiffFactory {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_NAMESPACES.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Serialize)]
struct ParameterDetails<'a> {
    name: Option<&'a str>,
    #[serde(rename = "type")]
    type_name: &'a QualifiedName,
}

fn details<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

impl ChangeLogDiffFactory {
    pub fn new(excluded_namespaces: Vec<String>) -> Self {
        Self {
            excluded_namespaces,
            include_type_details: false,
        }
    }

    /// Also report documentation and annotation changes under `ModelChanged`.
    /// Off by default: changed types only list fields added or removed.
    pub fn with_type_details(mut self, include: bool) -> Self {
        self.include_type_details = include;
        self
    }

    pub fn excluded_namespaces(&self) -> &[String] {
        &self.excluded_namespaces
    }

    /// Type diffs followed by service diffs.
    ///
    /// A member map that is the same allocation in both schemas is skipped
    /// without comparing its contents.
    pub fn build_diffs(&self, old: &Schema, new: &Schema) -> Vec<ChangeLogDiffEntry> {
        let mut diffs = Vec::new();
        if !Arc::ptr_eq(&old.types, &new.types) {
            diffs.extend(self.diff_members(
                &old.types,
                &new.types,
                Self::type_added,
                Self::type_removed,
                |old, new| self.type_changed(old, new),
            ));
        }
        if !Arc::ptr_eq(&old.services, &new.services) {
            diffs.extend(self.diff_members(
                &old.services,
                &new.services,
                Self::service_added,
                |s| vec![ChangeLogDiffEntry::new(s.name.short_display_name(), DiffKind::ServiceRemoved, s.name.clone())],
                Self::service_changed,
            ));
        }
        diffs
    }

    fn is_excluded(&self, name: &QualifiedName) -> bool {
        self.excluded_namespaces.iter().any(|ns| ns == name.namespace())
    }

    fn diff_members<T: PartialEq>(
        &self,
        old: &BTreeMap<QualifiedName, T>,
        new: &BTreeMap<QualifiedName, T>,
        added: impl Fn(&T) -> Vec<ChangeLogDiffEntry>,
        removed: impl Fn(&T) -> Vec<ChangeLogDiffEntry>,
        changed: impl Fn(&T, &T) -> Vec<ChangeLogDiffEntry>,
    ) -> Vec<ChangeLogDiffEntry> {
        let mut added_entries = Vec::new();
        let mut changed_entries = Vec::new();
        for (name, member) in new.iter().filter(|(name, _)| !self.is_excluded(name)) {
            match old.get(name) {
                None => added_entries.extend(added(member)),
                Some(previous) if previous != member => changed_entries.extend(changed(previous, member)),
                Some(_) => {}
            }
        }
        let removed_entries = old
            .iter()
            .filter(|(name, _)| !self.is_excluded(name) && !new.contains_key(*name))
            .flat_map(|(_, member)| removed(member));

        added_entries
            .into_iter()
            .chain(removed_entries)
            .chain(changed_entries)
            .collect()
    }

    fn type_added(ty: &Type) -> Vec<ChangeLogDiffEntry> {
        let children: Vec<ChangeLogDiffEntry> = ty
            .fields
            .keys()
            .map(|field| ChangeLogDiffEntry::new(field.as_str(), DiffKind::FieldAddedToModel, ty.name.clone()))
            .collect();
        let kind = if children.is_empty() {
            DiffKind::TypeAdded
        } else {
            DiffKind::ModelAdded
        };
        vec![ChangeLogDiffEntry::new(ty.name.short_display_name(), kind, ty.name.clone()).with_children(children)]
    }

    fn type_removed(ty: &Type) -> Vec<ChangeLogDiffEntry> {
        let kind = if ty.is_model() {
            DiffKind::ModelRemoved
        } else {
            DiffKind::TypeRemoved
        };
        vec![ChangeLogDiffEntry::new(ty.name.short_display_name(), kind, ty.name.clone())]
    }

    /// Reports fields added or removed by name. A field whose type changed
    /// produces no child entry.
    fn type_changed(&self, old: &Type, new: &Type) -> Vec<ChangeLogDiffEntry> {
        let display = new.name.short_display_name();
        let mut children: Vec<ChangeLogDiffEntry> = new
            .fields
            .keys()
            .filter(|f| !old.fields.contains_key(*f))
            .map(|f| ChangeLogDiffEntry::new(f.as_str(), DiffKind::FieldAddedToModel, new.name.clone()))
            .collect();
        children.extend(
            old.fields
                .keys()
                .filter(|f| !new.fields.contains_key(*f))
                .map(|f| ChangeLogDiffEntry::new(f.as_str(), DiffKind::FieldRemovedFromModel, new.name.clone())),
        );
        if self.include_type_details && old.type_doc != new.type_doc {
            children.push(
                ChangeLogDiffEntry::new(display, DiffKind::DocumentationChanged, new.name.clone())
                    .with_details(details(&old.type_doc), details(&new.type_doc)),
            );
        }
        if self.include_type_details && old.metadata != new.metadata {
            children.push(
                ChangeLogDiffEntry::new(display, DiffKind::MetadataChanged, new.name.clone())
                    .with_details(details(&old.metadata), details(&new.metadata)),
            );
        }
        vec![ChangeLogDiffEntry::new(display, DiffKind::ModelChanged, new.name.clone()).with_children(children)]
    }

    fn service_added(service: &Service) -> Vec<ChangeLogDiffEntry> {
        let children = service
            .operations
            .iter()
            .map(|op| ChangeLogDiffEntry::new(op.name(), DiffKind::OperationAdded, service.name.clone()))
            .collect();
        vec![
            ChangeLogDiffEntry::new(service.name.short_display_name(), DiffKind::ServiceAdded, service.name.clone())
                .with_children(children),
        ]
    }

    /// Operations are matched by qualified name only, so a changed signature
    /// is reported as a change rather than a removal plus an addition.
    fn service_changed(old: &Service, new: &Service) -> Vec<ChangeLogDiffEntry> {
        let mut children: Vec<ChangeLogDiffEntry> = new
            .operations
            .iter()
            .filter(|op| old.operation(&op.qualified_name).is_none())
            .map(|op| ChangeLogDiffEntry::new(op.name(), DiffKind::OperationAdded, op.qualified_name.clone()))
            .collect();
        children.extend(
            old.operations
                .iter()
                .filter(|op| new.operation(&op.qualified_name).is_none())
                .map(|op| ChangeLogDiffEntry::new(op.name(), DiffKind::OperationRemoved, op.qualified_name.clone())),
        );
        for new_op in &new.operations {
            let matches_old: Vec<&Operation> = old
                .operations
                .iter()
                .filter(|op| op.qualified_name == new_op.qualified_name)
                .collect();
            let matches_new = new
                .operations
                .iter()
                .filter(|op| op.qualified_name == new_op.qualified_name)
                .count();
            match (matches_old.as_slice(), matches_new) {
                ([], _) => {}
                ([old_op], 1) => children.extend(Self::operation_changed(old_op, new_op)),
                (found, _) => warn!(
                    operation = %new_op.qualified_name,
                    old_matches = found.len(),
                    new_matches = matches_new,
                    "Cannot build changelog entry, operation name is not unique"
                ),
            }
        }
        vec![
            ChangeLogDiffEntry::new(new.name.short_display_name(), DiffKind::ServiceChanged, new.name.clone())
                .with_children(children),
        ]
    }

    fn operation_changed(old: &Operation, new: &Operation) -> Vec<ChangeLogDiffEntry> {
        let mut entries = Vec::new();
        let entry = |kind| ChangeLogDiffEntry::new(new.name(), kind, new.qualified_name.clone());
        if old.return_type != new.return_type {
            entries.push(
                entry(DiffKind::OperationReturnValueChanged)
                    .with_details(details(&old.return_type.name), details(&new.return_type.name)),
            );
        }
        if old.parameters != new.parameters {
            let describe = |op: &Operation| {
                let params: Vec<ParameterDetails<'_>> = op
                    .parameters
                    .iter()
                    .map(|p| ParameterDetails {
                        name: p.name.as_deref(),
                        type_name: &p.type_ref.name,
                    })
                    .collect();
                details(&params)
            };
            entries.push(entry(DiffKind::OperationParametersChanged).with_details(describe(old), describe(new)));
        }
        if old.metadata != new.metadata {
            entries.push(
                entry(DiffKind::OperationMetadataChanged).with_details(details(&old.metadata), details(&new.metadata)),
            );
        }
        entries
    }
}
