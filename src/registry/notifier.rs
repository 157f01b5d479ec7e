//! Fan-out of schema set updates
//!
//! An ordered broadcast channel, plus the last published value so a new
//! subscriber starts from the current snapshot instead of waiting for the
//! next change.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use super::SchemaSet;

const DEFAULT_CAPACITY: usize = 64;

/// Publishes schema sets to subscribers
#[derive(Debug, Clone)]
pub struct SchemaNotifier {
    current: Arc<RwLock<Arc<SchemaSet>>>,
    sender: broadcast::Sender<Arc<SchemaSet>>,
}

impl Default for SchemaNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SchemaNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            current: Arc::new(RwLock::new(Arc::new(SchemaSet::empty()))),
            sender,
        }
    }

    /// Replace the current snapshot and notify subscribers
    pub fn publish(&self, schema_set: Arc<SchemaSet>) {
        // Held across the send so a concurrent subscribe sees either the old
        // snapshot plus this message, or the new snapshot without it.
        let mut current = self.current.write();
        *current = Arc::clone(&schema_set);
        // No receivers is fine
        let _ = self.sender.send(schema_set);
    }

    pub fn current(&self) -> Arc<SchemaSet> {
        Arc::clone(&self.current.read())
    }

    pub fn subscribe(&self) -> SchemaSubscription {
        let current = self.current.read();
        SchemaSubscription {
            initial: Some(Arc::clone(&current)),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live stream of schema sets, starting with the current one
#[derive(Debug)]
pub struct SchemaSubscription {
    initial: Option<Arc<SchemaSet>>,
    receiver: broadcast::Receiver<Arc<SchemaSet>>,
}

impl SchemaSubscription {
    /// Next schema set, or `None` once the notifier is gone.
    ///
    /// A subscriber that falls behind skips to the oldest retained update.
    pub async fn recv(&mut self) -> Option<Arc<SchemaSet>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.receiver.recv().await {
                Ok(schema_set) => return Some(schema_set),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Schema subscriber lagged, skipping updates");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(n: u64) -> Arc<SchemaSet> {
        Arc::new(SchemaSet {
            generation: n,
            ..SchemaSet::empty()
        })
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current() {
        let notifier = SchemaNotifier::default();
        notifier.publish(generation(1));
        notifier.publish(generation(2));

        let mut subscription = notifier.subscribe();
        assert_eq!(subscription.recv().await.unwrap().generation, 2);

        notifier.publish(generation(3));
        assert_eq!(subscription.recv().await.unwrap().generation, 3);
    }

    #[tokio::test]
    async fn test_updates_arrive_in_order() {
        let notifier = SchemaNotifier::default();
        let mut subscription = notifier.subscribe();
        for n in 1..=3 {
            notifier.publish(generation(n));
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(subscription.recv().await.unwrap().generation);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_closed_when_notifier_dropped() {
        let notifier = SchemaNotifier::default();
        let mut subscription = notifier.subscribe();
        drop(notifier);
        assert!(subscription.recv().await.is_some());
        assert!(subscription.recv().await.is_none());
    }
}
