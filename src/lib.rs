//! Schema Server
//!
//! Aggregates type and service definitions from many independently changing
//! sources into one continuously compiled schema.
//!
//! ## Features
//!
//! - **Multiple Transports**: local directories under watch, git repositories
//!   with branch-based changesets, and packages pushed by publishers
//! - **Partial Failure**: a broken package is reported, never merged, and
//!   never takes healthy packages down with it
//! - **Single Writer**: every update is serialized through one actor, so
//!   readers only ever see complete generations
//! - **Liveness**: push publishers are polled or tied to their connection,
//!   and their packages flagged when they disappear
//! - **Changelog**: every accepted transition is recorded as a structured diff
//!
//! ## Architecture
//!
//! ```text
//! watch ──► transport ──► SchemaStore (actor) ──► SchemaNotifier ──► subscribers
//!                              │      ▲
//!                              │      └── keepalive (publisher lost)
//!                              ▼
//!                   compiler + changelog
//! ```

pub mod changelog;
pub mod checksum;
pub mod compiler;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod schema;
pub mod server;
pub mod source;
pub mod transport;
pub mod version;
pub mod watch;

pub use changelog::{ChangeLogDiffEntry, ChangeLogDiffFactory, ChangeLogEntry, DiffKind};
pub use checksum::Checksum;
pub use compiler::{CompilationMessage, CompilerAdapter, SchemaCompiler, Severity, TaxiCompiler};
pub use config::SchemaServerConfig;
pub use error::{Result, SchemaError};
pub use registry::{SchemaSet, SchemaStore, StoreOptions, SubmissionResult};
pub use schema::{Document, QualifiedName, Schema};
pub use server::SchemaServer;
pub use source::{PackageIdentifier, ParsedPackage, SourcePackage, VersionedSource};
pub use version::PackageVersion;
