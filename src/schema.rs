//! Schema members and the merged schema view
//!
//! A [`Document`] holds the members one compilation produced. A [`Schema`]
//! is the union of the documents of every valid package, keyed by qualified
//! name so the same set of packages always merges to the same result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Namespace holding the compiler's built-in primitive types
pub const BUILTIN_NAMESPACE: &str = "lang.taxi";

/// Separator between a service name and an operation name
pub const OPERATION_SEPARATOR: &str = "@@";

/// Fully qualified name of a schema member (e.g. "film.types.Title")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualifiedName(String);

impl QualifiedName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Join a namespace and a simple name
    pub fn in_namespace(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}.{}", namespace, name))
        }
    }

    /// Qualified name of an operation within a service
    pub fn operation(service: &QualifiedName, operation: &str) -> Self {
        Self(format!("{}{}{}", service.0, OPERATION_SEPARATOR, operation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace portion; empty for names declared outside a namespace.
    /// For operations this is the namespace of the owning service.
    pub fn namespace(&self) -> &str {
        let owner = self.0.split(OPERATION_SEPARATOR).next().unwrap_or(&self.0);
        match owner.rfind('.') {
            Some(idx) => &owner[..idx],
            None => "",
        }
    }

    /// Name without its namespace, or the operation name for operations
    pub fn short_display_name(&self) -> &str {
        if let Some((_, op)) = self.0.split_once(OPERATION_SEPARATOR) {
            return op;
        }
        match self.0.rfind('.') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QualifiedName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An annotation attached to a member, field or operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: QualifiedName,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Reference to a type from a field, parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeReference {
    pub name: QualifiedName,
    /// `T[]`
    #[serde(default)]
    pub is_collection: bool,
}

impl TypeReference {
    pub fn new(name: QualifiedName) -> Self {
        Self { name, is_collection: false }
    }
}

impl fmt::Display for TypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_collection {
            write!(f, "{}[]", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// A field on a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub type_ref: TypeReference,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_doc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

/// A type or model definition
///
/// Equality is structural; where the type was declared is tracked by the
/// owning [`Document`], not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub name: QualifiedName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<QualifiedName>,
    /// Field name -> field. Non-empty for models.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_doc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Type {
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            inherits: Vec::new(),
            fields: BTreeMap::new(),
            enum_values: Vec::new(),
            type_doc: None,
            metadata: Vec::new(),
        }
    }

    /// Models are types that declare fields
    pub fn is_model(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// A parameter of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub type_ref: TypeReference,
}

/// An operation exposed by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// `Service@@operation`
    pub qualified_name: QualifiedName,
    pub parameters: Vec<Parameter>,
    pub return_type: TypeReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Operation {
    pub fn name(&self) -> &str {
        self.qualified_name.short_display_name()
    }
}

/// A service definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: QualifiedName,
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_doc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

impl Service {
    pub fn operation(&self, name: &QualifiedName) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.qualified_name == name)
    }
}

/// Members produced by compiling one package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub types: Vec<Type>,
    pub services: Vec<Service>,
    /// Member name -> name of the source file that declared it
    #[serde(default)]
    pub declared_in: BTreeMap<QualifiedName, String>,
}

impl Document {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.services.is_empty()
    }

    pub fn find_type(&self, name: &QualifiedName) -> Option<&Type> {
        self.types.iter().find(|t| &t.name == name)
    }

    pub fn has_type(&self, name: &QualifiedName) -> bool {
        self.find_type(name).is_some()
    }

    /// Names of every member, types first
    pub fn member_names(&self) -> impl Iterator<Item = &QualifiedName> {
        self.types
            .iter()
            .map(|t| &t.name)
            .chain(self.services.iter().map(|s| &s.name))
    }
}

/// Merged view over all valid packages
///
/// The member maps are reference counted so an unchanged map can be shared
/// between consecutive generations, which lets the changelog skip it cheaply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub types: Arc<BTreeMap<QualifiedName, Type>>,
    pub services: Arc<BTreeMap<QualifiedName, Service>>,
}

impl Schema {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge documents into one schema.
    ///
    /// Callers pass documents ordered by package id; when two packages
    /// declare the same name, the first one wins. Because the order is
    /// derived from package ids, the result does not depend on submission
    /// order.
    pub fn merge<'a>(documents: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut types = BTreeMap::new();
        let mut services = BTreeMap::new();
        for document in documents {
            for t in &document.types {
                types.entry(t.name.clone()).or_insert_with(|| t.clone());
            }
            for s in &document.services {
                services.entry(s.name.clone()).or_insert_with(|| s.clone());
            }
        }
        Self {
            types: Arc::new(types),
            services: Arc::new(services),
        }
    }

    /// Reuse this schema's member maps where `next` is structurally equal,
    /// so unchanged maps stay pointer-equal across generations.
    pub fn share_unchanged(&self, next: Schema) -> Schema {
        let types = if self.types == next.types {
            Arc::clone(&self.types)
        } else {
            next.types
        };
        let services = if self.services == next.services {
            Arc::clone(&self.services)
        } else {
            next.services
        };
        Schema { types, services }
    }

    pub fn find_type(&self, name: &str) -> Option<&Type> {
        self.types.get(&QualifiedName::new(name))
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.find_type(name).is_some()
    }

    pub fn find_service(&self, name: &str) -> Option<&Service> {
        self.services.get(&QualifiedName::new(name))
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.find_service(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.services.is_empty()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types && self.services == other.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str) -> Type {
        let mut t = Type::new(QualifiedName::new(name));
        t.inherits.push(QualifiedName::in_namespace(BUILTIN_NAMESPACE, "String"));
        t
    }

    #[test]
    fn test_qualified_name_parts() {
        let name = QualifiedName::new("film.types.Title");
        assert_eq!(name.namespace(), "film.types");
        assert_eq!(name.short_display_name(), "Title");

        let bare = QualifiedName::new("FirstName");
        assert_eq!(bare.namespace(), "");
        assert_eq!(bare.short_display_name(), "FirstName");
    }

    #[test]
    fn test_operation_names() {
        let service = QualifiedName::new("film.FilmService");
        let op = QualifiedName::operation(&service, "findAll");
        assert_eq!(op.as_str(), "film.FilmService@@findAll");
        assert_eq!(op.short_display_name(), "findAll");
        assert_eq!(op.namespace(), "film");
    }

    #[test]
    fn test_merge_first_declaration_wins() {
        let mut a = Document::empty();
        a.types.push(scalar("Name"));
        let mut b = Document::empty();
        let mut other = scalar("Name");
        other.type_doc = Some("from b".into());
        b.types.push(other);

        let merged = Schema::merge([&a, &b]);
        assert_eq!(merged.types.len(), 1);
        assert_eq!(merged.find_type("Name").unwrap().type_doc, None);
    }

    #[test]
    fn test_share_unchanged_keeps_pointers() {
        let mut doc = Document::empty();
        doc.types.push(scalar("Name"));
        let first = Schema::merge([&doc]);
        let second = first.share_unchanged(Schema::merge([&doc]));
        assert!(Arc::ptr_eq(&first.types, &second.types));
        assert!(Arc::ptr_eq(&first.services, &second.services));
    }
}
