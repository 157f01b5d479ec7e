//! Configuration management for the schema server
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schema-server.toml)
//! - Environment variables (SCHEMA_SERVER__*)
//!
//! ## Example config file (schema-server.toml):
//! ```toml
//! [file]
//! change_detection = "watch"
//! debounce_ms = 500
//!
//! [[file.projects]]
//! path = "./schemas/films"
//! editable = true
//!
//! [git]
//! checkout_root = "./git-checkouts"
//! poll_frequency_secs = 30
//!
//! [[git.repositories]]
//! name = "shared"
//! uri = "https://github.com/acme/shared-schemas.git"
//! branch = "main"
//!
//! [publishers]
//! lost_policy = "mark_unhealthy"
//!
//! [changelog]
//! max_entries = 200
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the schema server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaServerConfig {
    /// Local directory projects
    #[serde(default)]
    pub file: FileConfig,

    /// Version-controlled projects
    #[serde(default)]
    pub git: GitConfig,

    /// Liveness monitoring of push publishers
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    #[serde(default)]
    pub publishers: PublisherConfig,

    #[serde(default)]
    pub changelog: ChangeLogConfig,
}

/// How a loader notices changes on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetectionMethod {
    /// OS file notifications
    #[default]
    Watch,
    /// Periodic directory scans
    Poll,
}

/// Filesystem transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Project directories to load
    #[serde(default)]
    pub projects: Vec<FileProjectConfig>,

    #[serde(default)]
    pub change_detection: ChangeDetectionMethod,

    /// Scan interval when polling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time window for coalescing change bursts
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Emit a batch early once it holds this many changes
    #[serde(default = "default_debounce_max_batch")]
    pub debounce_max_batch: usize,

    /// Directory names never watched or scanned
    #[serde(default = "default_excluded_directories")]
    pub excluded_directories: Vec<String>,

    /// File extensions treated as schema sources
    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,
}

/// A single local project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProjectConfig {
    pub path: PathBuf,

    /// Whether edits may be written back
    #[serde(default)]
    pub editable: bool,
}

/// Git transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory holding local checkouts
    #[serde(default = "default_checkout_root")]
    pub checkout_root: PathBuf,

    /// Interval between fetches
    #[serde(default = "default_git_poll_secs")]
    pub poll_frequency_secs: u64,

    /// Upper bound on any single network operation
    #[serde(default = "default_git_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default)]
    pub repositories: Vec<GitRepositoryConfig>,
}

/// A single repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRepositoryConfig {
    /// Name of the local checkout directory
    pub name: String,

    /// Remote URL
    pub uri: String,

    /// Default branch
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Project directory within the repository
    #[serde(default)]
    pub path: PathBuf,

    #[serde(default)]
    pub editable: bool,

    #[serde(default)]
    pub pull_request: PullRequestConfig,
}

/// Branch naming and review links for changesets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestConfig {
    /// Prefix for changeset branches
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Link to open a review, with `{branch}` and `{base}` placeholders
    #[serde(default)]
    pub hosting_url_template: Option<String>,
}

/// Liveness monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// How often publishers are checked
    #[serde(default = "default_keep_alive_tick_ms")]
    pub tick_ms: u64,

    /// Timeout for a single liveness probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// What happens to a publisher's packages when it is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublisherLostPolicy {
    /// Keep the packages, flagged unhealthy
    #[default]
    MarkUnhealthy,
    /// Remove the packages from the schema
    Remove,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub lost_policy: PublisherLostPolicy,
}

/// Changelog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogConfig {
    /// Namespaces never reported
    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: Vec<String>,

    /// Entries retained in memory
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Report doc and annotation changes on changed types
    #[serde(default)]
    pub include_type_details: bool,
}

// Default value functions
fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_debounce_max_batch() -> usize {
    100
}

fn default_excluded_directories() -> Vec<String> {
    vec![".git".to_string(), "node_modules".to_string(), "target".to_string()]
}

fn default_suffixes() -> Vec<String> {
    vec!["taxi".to_string()]
}

fn default_checkout_root() -> PathBuf {
    PathBuf::from("./git-checkouts")
}

fn default_git_poll_secs() -> u64 {
    30
}

fn default_git_timeout_secs() -> u64 {
    60
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "schema-updates/".to_string()
}

fn default_keep_alive_tick_ms() -> u64 {
    1_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_excluded_namespaces() -> Vec<String> {
    crate::changelog::DEFAULT_EXCLUDED_NAMESPACES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_entries() -> usize {
    100
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            change_detection: ChangeDetectionMethod::Watch,
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            debounce_max_batch: default_debounce_max_batch(),
            excluded_directories: default_excluded_directories(),
            suffixes: default_suffixes(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            checkout_root: default_checkout_root(),
            poll_frequency_secs: default_git_poll_secs(),
            operation_timeout_secs: default_git_timeout_secs(),
            repositories: Vec::new(),
        }
    }
}

impl Default for PullRequestConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            hosting_url_template: None,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_keep_alive_tick_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            excluded_namespaces: default_excluded_namespaces(),
            max_entries: default_max_entries(),
            include_type_details: false,
        }
    }
}

impl FileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl GitConfig {
    pub fn poll_frequency(&self) -> Duration {
        Duration::from_secs(self.poll_frequency_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl KeepAliveConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl SchemaServerConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = [
            "schema-server.toml",
            ".schema-server.toml",
            "config/schema-server.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "schema-server") {
            let xdg_config = config_dir.config_dir().join("schema-server.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (SCHEMA_SERVER__*)
        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_SERVER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_toml()?)
    }

    pub fn to_toml(&self) -> std::io::Result<String> {
        toml::to_string_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Resolve a configured path against the working directory
    pub fn resolve_path(path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    /// Checkout directory for a repository
    pub fn checkout_dir(&self, repository: &GitRepositoryConfig) -> PathBuf {
        Self::resolve_path(&self.git.checkout_root).join(&repository.name)
    }
}
