//! Taxi compiler
//!
//! Compiles the sources of one package against the documents of the other
//! packages. Every file is tokenized and parsed on its own, so a syntax error
//! stays inside the file that contains it; type references are then resolved
//! across the whole package.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::lexer::tokenize;
use super::parser::{parse, Declaration, DeclarationKind, ParsedFile, RawAnnotation, RawTypeRef};
use super::{CompilationMessage, SchemaCompiler, Severity};
use crate::schema::{
    Document, Field, Metadata, Operation, Parameter, QualifiedName, Service, Type, TypeReference,
    BUILTIN_NAMESPACE,
};
use crate::source::VersionedSource;

/// Primitive types every package can reference without declaring
pub const BUILTIN_TYPES: [&str; 12] = [
    "String", "Int", "Decimal", "Boolean", "Date", "Instant", "DateTime", "Time", "Double",
    "Long", "Any", "Void",
];

/// Compiler for the taxi schema language
#[derive(Debug, Clone, Default)]
pub struct TaxiCompiler;

impl TaxiCompiler {
    pub fn new() -> Self {
        Self
    }
}

struct FileUnit<'a> {
    source_name: &'a str,
    file: ParsedFile,
}

/// Names a reference may resolve to
struct Scope {
    known: BTreeSet<QualifiedName>,
    by_short_name: BTreeMap<String, Vec<QualifiedName>>,
}

impl Scope {
    fn new(known: BTreeSet<QualifiedName>) -> Self {
        let mut by_short_name: BTreeMap<String, Vec<QualifiedName>> = BTreeMap::new();
        for name in &known {
            if name.namespace() != BUILTIN_NAMESPACE {
                by_short_name
                    .entry(name.short_display_name().to_string())
                    .or_default()
                    .push(name.clone());
            }
        }
        Self { known, by_short_name }
    }

    fn resolve(&self, written: &str, namespace: &str, imports: &[String]) -> Result<QualifiedName, String> {
        let exact = QualifiedName::new(written);
        if written.contains('.') {
            return if self.known.contains(&exact) {
                Ok(exact)
            } else {
                Err(format!("Type '{}' could not be resolved", written))
            };
        }

        let mut candidates = Vec::new();
        if !namespace.is_empty() {
            candidates.push(QualifiedName::in_namespace(namespace, written));
        }
        candidates.extend(
            imports
                .iter()
                .map(|i| QualifiedName::new(i.as_str()))
                .filter(|i| i.short_display_name() == written),
        );
        candidates.push(exact);
        candidates.push(QualifiedName::in_namespace(BUILTIN_NAMESPACE, written));

        if let Some(found) = candidates.into_iter().find(|c| self.known.contains(c)) {
            return Ok(found);
        }

        match self.by_short_name.get(written).map(Vec::as_slice) {
            Some([only]) => Ok(only.clone()),
            Some(many) if !many.is_empty() => Err(format!(
                "Type '{}' is ambiguous, import one of: {}",
                written,
                many.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(", ")
            )),
            _ => Err(format!("Type '{}' could not be resolved", written)),
        }
    }
}

struct Resolver<'a> {
    scope: &'a Scope,
    source_name: &'a str,
    namespace: &'a str,
    imports: &'a [String],
    messages: Vec<CompilationMessage>,
}

impl<'a> Resolver<'a> {
    fn type_name(&mut self, raw: &RawTypeRef) -> Option<QualifiedName> {
        match self.scope.resolve(&raw.name, self.namespace, self.imports) {
            Ok(name) => Some(name),
            Err(message) => {
                self.messages.push(CompilationMessage::new(
                    self.source_name,
                    raw.line,
                    raw.column,
                    message,
                    Severity::Error,
                ));
                None
            }
        }
    }

    fn type_ref(&mut self, raw: &RawTypeRef) -> Option<TypeReference> {
        self.type_name(raw).map(|name| TypeReference {
            name,
            is_collection: raw.is_collection,
        })
    }

    fn error(&mut self, line: usize, column: usize, message: String) {
        self.messages.push(CompilationMessage::new(
            self.source_name,
            line,
            column,
            message,
            Severity::Error,
        ));
    }
}

fn metadata(annotations: &[RawAnnotation]) -> Vec<Metadata> {
    annotations
        .iter()
        .map(|a| Metadata {
            name: QualifiedName::new(a.name.as_str()),
            params: a.params.clone(),
        })
        .collect()
}

fn build_type(name: QualifiedName, declaration: &Declaration, resolver: &mut Resolver<'_>) -> Option<Type> {
    let mut ty = Type::new(name);
    ty.type_doc = declaration.doc.clone();
    ty.metadata = metadata(&declaration.annotations);
    let mut ok = true;

    match &declaration.kind {
        DeclarationKind::Type { inherits, fields } => {
            for parent in inherits {
                match resolver.type_name(parent) {
                    Some(parent_name) if parent_name == ty.name => {
                        resolver.error(
                            parent.line,
                            parent.column,
                            format!("Type '{}' cannot inherit from itself", ty.name),
                        );
                        ok = false;
                    }
                    Some(parent_name) => ty.inherits.push(parent_name),
                    None => ok = false,
                }
            }
            for raw in fields {
                if ty.fields.contains_key(&raw.name) {
                    resolver.error(
                        raw.line,
                        raw.column,
                        format!("Field '{}' is declared more than once on '{}'", raw.name, ty.name),
                    );
                    ok = false;
                    continue;
                }
                let Some(type_ref) = resolver.type_ref(&raw.type_ref) else {
                    ok = false;
                    continue;
                };
                ty.fields.insert(
                    raw.name.clone(),
                    Field {
                        type_ref,
                        nullable: raw.nullable,
                        type_doc: raw.doc.clone(),
                        metadata: metadata(&raw.annotations),
                    },
                );
            }
        }
        DeclarationKind::Enum { values } => ty.enum_values = values.clone(),
        DeclarationKind::Service { .. } => return None,
    }

    ok.then_some(ty)
}

fn build_service(name: QualifiedName, declaration: &Declaration, resolver: &mut Resolver<'_>) -> Option<Service> {
    let DeclarationKind::Service { operations } = &declaration.kind else {
        return None;
    };
    let mut service = Service {
        name,
        operations: Vec::new(),
        type_doc: declaration.doc.clone(),
        metadata: metadata(&declaration.annotations),
    };
    let mut ok = true;
    let mut seen = BTreeSet::new();

    for raw in operations {
        if !seen.insert(raw.name.as_str()) {
            resolver.error(
                raw.line,
                raw.column,
                format!("Operation '{}' is declared more than once on '{}'", raw.name, service.name),
            );
            ok = false;
            continue;
        }
        let mut parameters = Vec::new();
        for p in &raw.parameters {
            match resolver.type_ref(&p.type_ref) {
                Some(type_ref) => parameters.push(Parameter {
                    name: p.name.clone(),
                    type_ref,
                }),
                None => ok = false,
            }
        }
        let return_type = match &raw.return_type {
            Some(r) => resolver.type_ref(r),
            None => Some(TypeReference::new(QualifiedName::in_namespace(BUILTIN_NAMESPACE, "Void"))),
        };
        let Some(return_type) = return_type else {
            ok = false;
            continue;
        };
        service.operations.push(Operation {
            qualified_name: QualifiedName::operation(&service.name, &raw.name),
            parameters,
            return_type,
            metadata: metadata(&raw.annotations),
        });
    }

    ok.then_some(service)
}

impl SchemaCompiler for TaxiCompiler {
    fn compile(&self, sources: &[VersionedSource], imports: &[Arc<Document>]) -> (Document, Vec<CompilationMessage>) {
        let mut messages = Vec::new();
        let mut units = Vec::with_capacity(sources.len());

        for source in sources {
            let (tokens, lex_messages) = tokenize(&source.name, &source.content);
            let (file, parse_messages) = parse(&source.name, &tokens);
            messages.extend(lex_messages);
            messages.extend(parse_messages);
            units.push(FileUnit {
                source_name: &source.name,
                file,
            });
        }

        // First declaration of a name wins; later ones are errors in their own file
        let mut declared: BTreeMap<QualifiedName, &str> = BTreeMap::new();
        let mut duplicates: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (file_idx, unit) in units.iter().enumerate() {
            for (decl_idx, declaration) in unit.file.declarations.iter().enumerate() {
                let name = QualifiedName::in_namespace(&declaration.namespace, &declaration.name);
                if let Some(first) = declared.get(&name) {
                    messages.push(CompilationMessage::new(
                        unit.source_name,
                        declaration.line,
                        declaration.column,
                        format!("'{}' is already declared in {}", name, first),
                        Severity::Error,
                    ));
                    duplicates.insert((file_idx, decl_idx));
                } else {
                    declared.insert(name, unit.source_name);
                }
            }
        }

        let mut known: BTreeSet<QualifiedName> = BUILTIN_TYPES
            .iter()
            .map(|t| QualifiedName::in_namespace(BUILTIN_NAMESPACE, t))
            .collect();
        for unit in &units {
            for declaration in &unit.file.declarations {
                if !matches!(declaration.kind, DeclarationKind::Service { .. }) {
                    known.insert(QualifiedName::in_namespace(&declaration.namespace, &declaration.name));
                }
            }
        }
        for document in imports {
            known.extend(document.types.iter().map(|t| t.name.clone()));
        }
        let scope = Scope::new(known);

        let mut document = Document::empty();
        for (file_idx, unit) in units.iter().enumerate() {
            for (decl_idx, declaration) in unit.file.declarations.iter().enumerate() {
                if duplicates.contains(&(file_idx, decl_idx)) {
                    continue;
                }
                let name = QualifiedName::in_namespace(&declaration.namespace, &declaration.name);
                let mut resolver = Resolver {
                    scope: &scope,
                    source_name: unit.source_name,
                    namespace: &declaration.namespace,
                    imports: &unit.file.imports,
                    messages: Vec::new(),
                };
                match &declaration.kind {
                    DeclarationKind::Service { .. } => {
                        if let Some(service) = build_service(name.clone(), declaration, &mut resolver) {
                            document.services.push(service);
                            document.declared_in.insert(name, unit.source_name.to_string());
                        }
                    }
                    _ => {
                        if let Some(ty) = build_type(name.clone(), declaration, &mut resolver) {
                            document.types.push(ty);
                            document.declared_in.insert(name, unit.source_name.to_string());
                        }
                    }
                }
                messages.extend(resolver.messages);
            }
        }

        (document, messages)
    }
}
