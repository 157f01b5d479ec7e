//! Writes edited sources back into a project

use std::path::{Component, Path, PathBuf};

use tracing::info;

use crate::error::{Result, SchemaError};
use crate::source::VersionedSource;

#[derive(Debug, Clone)]
pub struct FileSystemPackageWriter {
    source_root: PathBuf,
}

impl FileSystemPackageWriter {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Write each source to `<source_root>/<name>`, creating directories.
    ///
    /// Every name is checked before anything is written, so a rejected batch
    /// leaves the project untouched.
    pub fn write_sources(&self, sources: &[VersionedSource]) -> Result<Vec<PathBuf>> {
        let targets = sources
            .iter()
            .map(|source| self.resolve(&source.name))
            .collect::<Result<Vec<_>>>()?;

        for (source, target) in sources.iter().zip(&targets) {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, &source.content)?;
            info!(path = %target.display(), "Wrote source");
        }
        Ok(targets)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(SchemaError::Configuration(format!(
                "source name '{}' must be a relative path inside {}",
                name,
                self.source_root.display()
            )));
        }
        Ok(self.source_root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_nested_sources() {
        let dir = TempDir::new().unwrap();
        let writer = FileSystemPackageWriter::new(dir.path().join("src"));
        let written = writer
            .write_sources(&[VersionedSource::unversioned("people/names.taxi", "type FirstName inherits String")])
            .unwrap();
        assert_eq!(written, vec![dir.path().join("src/people/names.taxi")]);
        assert_eq!(
            std::fs::read_to_string(&written[0]).unwrap(),
            "type FirstName inherits String"
        );
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let writer = FileSystemPackageWriter::new(dir.path().join("src"));
        for name in ["../outside.taxi", "/etc/passwd", "a/../../b.taxi", ""] {
            let result = writer.write_sources(&[
                VersionedSource::unversioned("ok.taxi", "type Ok"),
                VersionedSource::unversioned(name, "type Bad"),
            ]);
            assert!(matches!(result, Err(SchemaError::Configuration(_))), "{}", name);
        }
        assert!(!dir.path().join("src/ok.taxi").exists());
    }
}
