//! Error types for the schema server

use std::time::Duration;

use thiserror::Error;

/// Result type for schema server operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Schema server errors
///
/// Compilation problems are not errors at this level: they travel as
/// [`CompilationMessage`](crate::compiler::CompilationMessage) data inside
/// parsed packages and submission results.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("Invalid package identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Package {0} is not editable")]
    NotEditable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Parse error in {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("Schema store has shut down")]
    StoreClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SchemaError {
    /// Whether this error belongs to a background transport cycle, and should
    /// be logged and retried rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchemaError::Transport(_)
                | SchemaError::Timeout { .. }
                | SchemaError::Io(_)
                | SchemaError::Git(_)
                | SchemaError::Watch(_)
                | SchemaError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SchemaError::Transport("fetch failed".into()).is_transient());
        assert!(SchemaError::Timeout {
            operation: "fetch".into(),
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!SchemaError::Configuration("missing taxi.toml".into()).is_transient());
        assert!(!SchemaError::StoreClosed.is_transient());
    }
}
