//! Schema compilation
//!
//! The registry treats the compiler as a pure function from sources (plus
//! the documents they may import) to a [`Document`] and diagnostics. The
//! [`CompilerAdapter`] runs it for one package at a time and turns the
//! output into a [`ParsedPackage`].

mod lexer;
mod parser;
pub mod taxi;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::schema::Document;
use crate::source::{ParsedPackage, SourcePackage, VersionedSource};

pub use taxi::TaxiCompiler;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A compiler diagnostic, scoped to a position in one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationMessage {
    pub source_name: String,
    /// 1-based
    pub line: usize,
    /// 1-based
    pub column: usize,
    pub message: String,
    pub severity: Severity,
}

impl CompilationMessage {
    pub fn new(
        source_name: impl Into<String>,
        line: usize,
        column: usize,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            line,
            column,
            message: message.into(),
            severity,
        }
    }

    pub fn error(source_name: impl Into<String>, line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(source_name, line, column, message, Severity::Error)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for CompilationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.source_name, self.line, self.column, self.severity, self.message
        )
    }
}

/// Compiles a set of sources into a document.
///
/// Implementations must be pure: the same sources and imports always
/// produce the same document and diagnostics.
pub trait SchemaCompiler: Send + Sync {
    fn compile(&self, sources: &[VersionedSource], imports: &[Arc<Document>]) -> (Document, Vec<CompilationMessage>);
}

/// Runs the compiler once per changed package
#[derive(Clone)]
pub struct CompilerAdapter {
    compiler: Arc<dyn SchemaCompiler>,
}

impl fmt::Debug for CompilerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerAdapter").finish_non_exhaustive()
    }
}

impl Default for CompilerAdapter {
    fn default() -> Self {
        Self::new(Arc::new(TaxiCompiler::new()))
    }
}

impl CompilerAdapter {
    pub fn new(compiler: Arc<dyn SchemaCompiler>) -> Self {
        Self { compiler }
    }

    /// Compile `candidate` with `context` (the documents of every other
    /// valid package) available as imports.
    ///
    /// Never fails: a compiler panic becomes an error diagnostic on every
    /// source of the candidate.
    pub fn validate(&self, context: &[Arc<Document>], candidate: SourcePackage) -> ParsedPackage {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.compiler.compile(&candidate.sources, context)
        }));

        match outcome {
            Ok((document, messages)) => {
                debug!(
                    package = %candidate.identifier(),
                    members = document.types.len() + document.services.len(),
                    diagnostics = messages.len(),
                    "Compiled package"
                );
                ParsedPackage::new(candidate, document, messages)
            }
            Err(_) => {
                error!(package = %candidate.identifier(), "Compiler panicked");
                let mut messages: Vec<CompilationMessage> = candidate
                    .sources
                    .iter()
                    .map(|s| CompilationMessage::error(s.name.clone(), 1, 1, "Compilation failed unexpectedly"))
                    .collect();
                if messages.is_empty() {
                    messages.push(CompilationMessage::error(
                        candidate.identifier().id(),
                        1,
                        1,
                        "Compilation failed unexpectedly",
                    ));
                }
                ParsedPackage::new(candidate, Document::empty(), messages)
            }
        }
    }
}
