//! Project descriptor (`taxi.toml`)
//!
//! ```toml
//! name = "com.acme/films"
//! version = "0.2.0"
//! source_root = "src/"
//!
//! [dependencies]
//! "com.acme/shared" = "1.0.0"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SchemaError};
use crate::source::PackageIdentifier;

pub const PROJECT_DESCRIPTOR_FILE: &str = "taxi.toml";

const FALLBACK_ORGANISATION: &str = "local";
const FALLBACK_VERSION: &str = "0.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    /// `organisation/name`
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Directory holding sources, relative to the project root
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// `organisation/name` to version
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

fn default_version() -> String {
    FALLBACK_VERSION.to_string()
}

fn default_source_root() -> PathBuf {
    PathBuf::from("src/")
}

impl ProjectDescriptor {
    /// Read `taxi.toml` from a project root, if present
    pub fn load(project_root: &Path) -> Result<Option<Self>> {
        let path = project_root.join(PROJECT_DESCRIPTOR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let descriptor: Self = toml::from_str(&content)?;
        descriptor.identifier()?;
        Ok(Some(descriptor))
    }

    /// Descriptor used when a directory carries none: every file under the
    /// directory, identified by the directory name
    pub fn implicit(project_root: &Path) -> Self {
        let name = project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "schemas".to_string());
        Self {
            name: format!("{}/{}", FALLBACK_ORGANISATION, name),
            version: default_version(),
            source_root: PathBuf::from("."),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn identifier(&self) -> Result<PackageIdentifier> {
        let (organisation, name) = split_name(&self.name)?;
        Ok(PackageIdentifier::new(organisation, name, self.version.clone()))
    }

    pub fn dependency_identifiers(&self) -> Result<Vec<PackageIdentifier>> {
        self.dependencies
            .iter()
            .map(|(name, version)| {
                let (organisation, name) = split_name(name)?;
                Ok(PackageIdentifier::new(organisation, name, version.clone()))
            })
            .collect()
    }

    /// Absolute source directory for a project rooted at `project_root`
    pub fn source_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.source_root)
    }
}

fn split_name(name: &str) -> Result<(&str, &str)> {
    match name.split_once('/') {
        Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => Ok((org, name)),
        _ => Err(SchemaError::InvalidIdentifier(format!(
            "project name '{}' - expected organisation/name",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_descriptor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_DESCRIPTOR_FILE),
            r#"
name = "com.acme/films"
version = "0.2.0"

[dependencies]
"com.acme/shared" = "1.0.0"
"#,
        )
        .unwrap();

        let descriptor = ProjectDescriptor::load(dir.path()).unwrap().unwrap();
        assert_eq!(descriptor.identifier().unwrap().id(), "com.acme/films/0.2.0");
        assert_eq!(descriptor.source_dir(dir.path()), dir.path().join("src/"));
        assert_eq!(
            descriptor.dependency_identifiers().unwrap(),
            vec![PackageIdentifier::new("com.acme", "shared", "1.0.0")]
        );
    }

    #[test]
    fn test_missing_descriptor() {
        let dir = TempDir::new().unwrap();
        assert!(ProjectDescriptor::load(dir.path()).unwrap().is_none());

        let implicit = ProjectDescriptor::implicit(&dir.path().join("films"));
        assert_eq!(implicit.identifier().unwrap().unversioned_id(), "local/films");
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROJECT_DESCRIPTOR_FILE), "name = \"films\"\n").unwrap();
        assert!(matches!(
            ProjectDescriptor::load(dir.path()),
            Err(SchemaError::InvalidIdentifier(_))
        ));
    }
}
