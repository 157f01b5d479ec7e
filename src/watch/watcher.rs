//! Notification-based change detection
//!
//! Every directory under the root gets its own non-recursive watch, so
//! excluded directories (such as `.git`) are never watched at all.
//! Directories created later are picked up as their create events arrive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{is_excluded, ChangeKind, Debouncer, FileChange, FileSystemMonitor};
use crate::error::Result;

pub struct WatchingMonitor {
    root: PathBuf,
    excluded: Arc<Vec<String>>,
    debouncer: Debouncer,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchingMonitor {
    pub fn new(root: impl Into<PathBuf>, excluded: Vec<String>, debouncer: Debouncer) -> Self {
        Self {
            root: root.into(),
            excluded: Arc::new(excluded),
            debouncer,
            watcher: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Register a watch on `dir` and every non-excluded directory below it
fn watch_tree(watcher: &mut RecommendedWatcher, root: &Path, dir: &Path, excluded: &[String]) -> usize {
    let mut registered = 0;
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !is_excluded(root, e.path(), excluded))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        match watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => registered += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to watch directory"),
        }
    }
    registered
}

fn classify(event: &Event) -> Vec<FileChange> {
    let change = |path: &PathBuf, kind| FileChange {
        path: path.clone(),
        kind,
    };
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| change(p, ChangeKind::Created)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| change(p, ChangeKind::Deleted)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| change(p, ChangeKind::Deleted)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| change(p, ChangeKind::Created)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![change(from, ChangeKind::Deleted), change(to, ChangeKind::Created)],
            paths => paths.iter().map(|p| change(p, ChangeKind::Modified)).collect(),
        },
        EventKind::Modify(_) => event.paths.iter().map(|p| change(p, ChangeKind::Modified)).collect(),
        _ => Vec::new(),
    }
}

impl FileSystemMonitor for WatchingMonitor {
    fn start_watching(&self) -> Result<mpsc::Receiver<Vec<FileChange>>> {
        self.stop();
        let root = std::fs::canonicalize(&self.root)?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // Receiver gone means the monitor stopped
            let _ = event_tx.send(event);
        })?;
        let registered = watch_tree(&mut watcher, &root, &root, &self.excluded);
        *self.watcher.lock() = Some(watcher);
        info!(root = %root.display(), directories = registered, "Watching for changes");

        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (batches, debounce_task) = self.debouncer.spawn(change_rx);

        let excluded = Arc::clone(&self.excluded);
        let watcher = Arc::clone(&self.watcher);
        let event_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Watch error");
                        continue;
                    }
                };
                for change in classify(&event) {
                    if is_excluded(&root, &change.path, &excluded) {
                        continue;
                    }
                    if change.kind == ChangeKind::Created && change.path.is_dir() {
                        if let Some(w) = watcher.lock().as_mut() {
                            let added = watch_tree(w, &root, &change.path, &excluded);
                            debug!(path = %change.path.display(), directories = added, "Watching new directory");
                        }
                    }
                    if change_tx.send(change).is_err() {
                        return;
                    }
                }
            }
        });

        self.tasks.lock().extend([event_task, debounce_task]);
        Ok(batches)
    }

    fn stop(&self) {
        // Dropping the watcher releases every registered watch
        if self.watcher.lock().take().is_some() {
            debug!(root = %self.root.display(), "Stopped watching");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for WatchingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_classify_rename() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/a.taxi"))
            .add_path(PathBuf::from("/b.taxi"));
        let kinds: Vec<ChangeKind> = classify(&event).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Deleted, ChangeKind::Created]);
    }

    #[test]
    fn test_classify_create_and_remove() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/a"));
        assert_eq!(classify(&created)[0].kind, ChangeKind::Created);
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/a"));
        assert_eq!(classify(&removed)[0].kind, ChangeKind::Deleted);
        assert!(classify(&Event::new(EventKind::Any)).is_empty());
    }

    #[tokio::test]
    async fn test_detects_new_file() {
        let dir = TempDir::new().unwrap();
        let monitor = WatchingMonitor::new(
            dir.path(),
            vec![".git".into()],
            Debouncer::new(Duration::from_millis(50), 100),
        );
        let mut batches = monitor.start_watching().unwrap();

        std::fs::write(dir.path().join("a.taxi"), "type A").unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(10), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(batch.iter().any(|c| c.path.ends_with("a.taxi")));
        monitor.stop();
    }
}
