//! Scan-based change detection

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{is_excluded, ChangeKind, Debouncer, FileChange, FileSystemMonitor};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

type Snapshot = BTreeMap<PathBuf, FileStamp>;

/// Detects changes by periodically snapshotting the tree
pub struct PollingMonitor {
    root: PathBuf,
    excluded: Arc<Vec<String>>,
    interval: Duration,
    debouncer: Debouncer,
    snapshot: Arc<Mutex<Snapshot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingMonitor {
    pub fn new(root: impl Into<PathBuf>, excluded: Vec<String>, interval: Duration, debouncer: Debouncer) -> Self {
        Self {
            root: root.into(),
            excluded: Arc::new(excluded),
            interval,
            debouncer,
            snapshot: Arc::new(Mutex::new(Snapshot::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Rescan immediately and return what changed since the last scan
    pub fn poll_now(&self) -> Vec<FileChange> {
        scan_and_diff(&self.root, &self.excluded, &self.snapshot)
    }
}

fn take_snapshot(root: &Path, excluded: &[String]) -> Snapshot {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_excluded(root, e.path(), excluded))
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let metadata = e.metadata().ok()?;
            Some((
                e.path().to_path_buf(),
                FileStamp {
                    modified: metadata.modified().ok(),
                    len: metadata.len(),
                },
            ))
        })
        .collect()
}

fn diff(previous: &Snapshot, next: &Snapshot) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = next
        .iter()
        .filter_map(|(path, stamp)| match previous.get(path) {
            None => Some(ChangeKind::Created),
            Some(old) if old != stamp => Some(ChangeKind::Modified),
            Some(_) => None,
        }
        .map(|kind| FileChange {
            path: path.clone(),
            kind,
        }))
        .collect();
    changes.extend(
        previous
            .keys()
            .filter(|path| !next.contains_key(*path))
            .map(|path| FileChange {
                path: path.clone(),
                kind: ChangeKind::Deleted,
            }),
    );
    changes
}

fn scan_and_diff(root: &Path, excluded: &[String], snapshot: &Mutex<Snapshot>) -> Vec<FileChange> {
    let next = take_snapshot(root, excluded);
    let mut current = snapshot.lock();
    let changes = diff(&current, &next);
    *current = next;
    changes
}

impl FileSystemMonitor for PollingMonitor {
    fn start_watching(&self) -> Result<mpsc::Receiver<Vec<FileChange>>> {
        self.stop();
        *self.snapshot.lock() = take_snapshot(&self.root, &self.excluded);

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batches, debounce_task) = self.debouncer.spawn(raw_rx);

        let root = self.root.clone();
        let excluded = Arc::clone(&self.excluded);
        let snapshot = Arc::clone(&self.snapshot);
        let interval = self.interval;
        let poll_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (root, excluded, snapshot) = (root.clone(), Arc::clone(&excluded), Arc::clone(&snapshot));
                let changes = match tokio::task::spawn_blocking(move || scan_and_diff(&root, &excluded, &snapshot)).await {
                    Ok(changes) => changes,
                    Err(e) => {
                        warn!(error = %e, "Directory scan failed");
                        continue;
                    }
                };
                for change in changes {
                    if raw_tx.send(change).is_err() {
                        return;
                    }
                }
            }
        });

        debug!(root = %self.root.display(), interval_ms = interval.as_millis() as u64, "Polling for changes");
        self.tasks.lock().extend([poll_task, debounce_task]);
        Ok(batches)
    }

    fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for PollingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_poll_now_reports_changes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.taxi"), "type A").unwrap();
        let monitor = PollingMonitor::new(
            dir.path(),
            vec![".git".into()],
            Duration::from_secs(1),
            Debouncer::new(Duration::from_millis(10), 10),
        );
        assert_eq!(monitor.poll_now().len(), 1);
        assert!(monitor.poll_now().is_empty());

        fs::write(dir.path().join("a.taxi"), "type A inherits String").unwrap();
        fs::write(dir.path().join("b.taxi"), "type B").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), "ref").unwrap();
        let mut changes = monitor.poll_now();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Modified, ChangeKind::Created]);

        fs::remove_file(dir.path().join("b.taxi")).unwrap();
        assert_eq!(
            monitor.poll_now(),
            vec![FileChange {
                path: dir.path().join("b.taxi"),
                kind: ChangeKind::Deleted
            }]
        );
    }

    #[tokio::test]
    async fn test_polling_emits_batches() {
        let dir = TempDir::new().unwrap();
        let monitor = PollingMonitor::new(
            dir.path(),
            vec![],
            Duration::from_millis(20),
            Debouncer::new(Duration::from_millis(20), 10),
        );
        let mut batches = monitor.start_watching().unwrap();
        fs::write(dir.path().join("a.taxi"), "type A").unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].kind, ChangeKind::Created);
        monitor.stop();
    }
}
