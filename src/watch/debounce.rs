//! Coalescing of change bursts
//!
//! A checkout or a save-all touches many files within milliseconds. The
//! debouncer collects changes until the window since the first one closes
//! (or the batch is full) and emits them as one batch, with each path
//! appearing once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::{ChangeKind, FileChange};

#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    window: Duration,
    max_batch: usize,
}

impl Debouncer {
    pub fn new(window: Duration, max_batch: usize) -> Self {
        Self {
            window,
            max_batch: max_batch.max(1),
        }
    }

    /// Run the debouncer on its own task.
    ///
    /// The task ends when `input` closes (after flushing) or when the
    /// returned receiver is dropped.
    pub fn spawn(
        self,
        input: mpsc::UnboundedReceiver<FileChange>,
    ) -> (mpsc::Receiver<Vec<FileChange>>, JoinHandle<()>) {
        let (output, batches) = mpsc::channel(16);
        let handle = tokio::spawn(self.run(input, output));
        (batches, handle)
    }

    async fn run(self, mut input: mpsc::UnboundedReceiver<FileChange>, output: mpsc::Sender<Vec<FileChange>>) {
        while let Some(first) = input.recv().await {
            let mut batch = Batch::default();
            batch.push(first);
            let deadline = Instant::now() + self.window;
            let mut closed = false;

            while batch.len() < self.max_batch {
                tokio::select! {
                    next = input.recv() => match next {
                        Some(change) => batch.push(change),
                        None => {
                            closed = true;
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            let changes = batch.into_changes();
            trace!(changes = changes.len(), "Emitting debounced batch");
            if output.send(changes).await.is_err() || closed {
                return;
            }
        }
    }
}

/// Changes in arrival order, one per path
#[derive(Default)]
struct Batch {
    changes: Vec<FileChange>,
    index: HashMap<PathBuf, usize>,
}

impl Batch {
    fn len(&self) -> usize {
        self.changes.len()
    }

    fn push(&mut self, change: FileChange) {
        match self.index.get(&change.path) {
            Some(&i) => {
                let existing = &mut self.changes[i];
                existing.kind = merge_kinds(existing.kind, change.kind);
            }
            None => {
                self.index.insert(change.path.clone(), self.changes.len());
                self.changes.push(change);
            }
        }
    }

    fn into_changes(self) -> Vec<FileChange> {
        self.changes
    }
}

fn merge_kinds(earlier: ChangeKind, later: ChangeKind) -> ChangeKind {
    match (earlier, later) {
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Modified,
        (_, later) => later,
    }
}
