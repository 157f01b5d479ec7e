//! Filesystem change detection
//!
//! Two interchangeable strategies behind [`FileSystemMonitor`]:
//! OS notifications ([`WatchingMonitor`]) and periodic scans
//! ([`PollingMonitor`]). Both debounce before emitting, so a burst of
//! changes produces one batch.

mod debounce;
mod poll;
mod watcher;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ChangeDetectionMethod, FileConfig};
use crate::error::Result;

pub use debounce::Debouncer;
pub use poll::PollingMonitor;
pub use watcher::WatchingMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A single change to an absolute path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Source of debounced change batches for one directory tree
pub trait FileSystemMonitor: Send + Sync {
    /// Begin watching. Each call replaces any previous watch.
    fn start_watching(&self) -> Result<mpsc::Receiver<Vec<FileChange>>>;

    /// Stop watching and release all watch handles
    fn stop(&self);

    fn root(&self) -> &Path;
}

/// Build the monitor configured for `root`
pub fn monitor_for(root: impl Into<PathBuf>, config: &FileConfig) -> Box<dyn FileSystemMonitor> {
    let debouncer = Debouncer::new(config.debounce_window(), config.debounce_max_batch);
    match config.change_detection {
        ChangeDetectionMethod::Watch => Box::new(WatchingMonitor::new(
            root,
            config.excluded_directories.clone(),
            debouncer,
        )),
        ChangeDetectionMethod::Poll => Box::new(PollingMonitor::new(
            root,
            config.excluded_directories.clone(),
            config.poll_interval(),
            debouncer,
        )),
    }
}

/// True if any component of `path` below `root` is an excluded name
pub(crate) fn is_excluded(root: &Path, path: &Path, excluded: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|c| match c {
        Component::Normal(name) => excluded.iter().any(|e| name == e.as_str()),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_excluded() {
        let root = Path::new("/repo");
        let excluded = vec![".git".to_string()];
        assert!(is_excluded(root, Path::new("/repo/.git/HEAD"), &excluded));
        assert!(!is_excluded(root, Path::new("/repo/src/film.taxi"), &excluded));
        assert!(!is_excluded(Path::new("/home/.git/checkout"), Path::new("/home/.git/checkout/a.taxi"), &excluded));
    }
}
