//! Last-seen bookkeeping and eviction of lost publishers

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::{KeepAliveStrategy, LivenessProbe, PublisherConfiguration};
use crate::config::KeepAliveConfig;
use crate::error::SchemaError;

const TERMINATED_CAPACITY: usize = 64;

struct Tracked {
    config: PublisherConfiguration,
    last_ping: Instant,
}

/// Cloneable handle; all clones share the same publisher table
#[derive(Clone)]
pub struct KeepAliveMonitor {
    inner: Arc<MonitorState>,
}

struct MonitorState {
    probe: Arc<dyn LivenessProbe>,
    tick: Duration,
    probe_timeout: Duration,
    publishers: Mutex<HashMap<String, Tracked>>,
    terminated: broadcast::Sender<PublisherConfiguration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, config: &KeepAliveConfig) -> Self {
        Self::with_timing(probe, config.tick(), config.probe_timeout())
    }

    /// `tick` is how often due publishers are probed; each probe is bounded
    /// by `probe_timeout`
    pub fn with_timing(probe: Arc<dyn LivenessProbe>, tick: Duration, probe_timeout: Duration) -> Self {
        let (terminated, _) = broadcast::channel(TERMINATED_CAPACITY);
        Self {
            inner: Arc::new(MonitorState {
                probe,
                tick,
                probe_timeout,
                publishers: Mutex::new(HashMap::new()),
                terminated,
                task: Mutex::new(None),
            }),
        }
    }

    /// Track a publisher, or refresh its strategy. Counts as a ping.
    ///
    /// Publishers without a keep-alive strategy are never tracked.
    pub fn monitor(&self, config: PublisherConfiguration) {
        let mut publishers = self.inner.publishers.lock();
        if !config.keep_alive.is_monitored() {
            publishers.remove(&config.publisher_id);
            return;
        }
        debug!(publisher = %config.publisher_id, strategy = ?config.keep_alive, "Monitoring publisher");
        publishers.insert(
            config.publisher_id.clone(),
            Tracked {
                config,
                last_ping: Instant::now(),
            },
        );
    }

    /// Record that a publisher was seen. Returns false for unknown publishers.
    pub fn ping(&self, publisher_id: &str) -> bool {
        self.inner.ping(publisher_id)
    }

    pub fn last_ping(&self, publisher_id: &str) -> Option<Instant> {
        self.inner.publishers.lock().get(publisher_id).map(|t| t.last_ping)
    }

    pub fn is_monitored(&self, publisher_id: &str) -> bool {
        self.inner.publishers.lock().contains_key(publisher_id)
    }

    /// Stop tracking without emitting a termination
    pub fn unregister(&self, publisher_id: &str) -> Option<PublisherConfiguration> {
        self.inner.publishers.lock().remove(publisher_id).map(|t| t.config)
    }

    pub fn terminated(&self) -> broadcast::Receiver<PublisherConfiguration> {
        self.inner.terminated.subscribe()
    }

    /// Declare a publisher lost now
    pub fn terminate(&self, publisher_id: &str, reason: &str) -> Option<PublisherConfiguration> {
        self.inner.terminate(publisher_id, reason)
    }

    /// Transport callback for a closed connection. Terminates every publisher
    /// bound to it.
    pub fn connection_closed(&self, connection_id: &str) -> Vec<PublisherConfiguration> {
        let bound: Vec<String> = self
            .inner
            .publishers
            .lock()
            .values()
            .filter(|t| {
                matches!(&t.config.keep_alive, KeepAliveStrategy::Connection { connection_id: id } if id == connection_id)
            })
            .map(|t| t.config.publisher_id.clone())
            .collect();
        bound
            .iter()
            .filter_map(|id| self.inner.terminate(id, "connection closed"))
            .collect()
    }

    /// Probe every polled publisher whose interval has elapsed. Returns the
    /// ids of publishers found lost.
    pub async fn check_now(&self) -> Vec<String> {
        MonitorState::check(&self.inner).await
    }

    /// Probe on every tick until stopped
    pub fn start(&self) {
        self.stop();
        let state: Weak<MonitorState> = Arc::downgrade(&self.inner);
        let tick = self.inner.tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(state) = state.upgrade() else { break };
                MonitorState::check(&state).await;
            }
        });
        *self.inner.task.lock() = Some(task);
        info!(tick_ms = tick.as_millis() as u64, "Keep-alive monitor started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }
}

impl MonitorState {
    fn ping(&self, publisher_id: &str) -> bool {
        match self.publishers.lock().get_mut(publisher_id) {
            Some(tracked) => {
                tracked.last_ping = Instant::now();
                true
            }
            None => false,
        }
    }

    fn terminate(&self, publisher_id: &str, reason: &str) -> Option<PublisherConfiguration> {
        let config = self.publishers.lock().remove(publisher_id)?.config;
        warn!(publisher = %publisher_id, reason, "Publisher lost");
        if self.terminated.send(config.clone()).is_err() {
            debug!(publisher = %publisher_id, "No listeners for terminated publisher");
        }
        Some(config)
    }

    /// Publishers due a probe, with the ping time the decision was based on
    fn due(&self, now: Instant) -> Vec<(String, Url, Instant)> {
        self.publishers
            .lock()
            .values()
            .filter_map(|t| match &t.config.keep_alive {
                KeepAliveStrategy::HttpPoll {
                    url,
                    poll_frequency_secs,
                } if now.duration_since(t.last_ping) >= Duration::from_secs(*poll_frequency_secs) => {
                    Some((t.config.publisher_id.clone(), url.clone(), t.last_ping))
                }
                _ => None,
            })
            .collect()
    }

    async fn check(state: &Arc<Self>) -> Vec<String> {
        let due = state.due(Instant::now());
        if due.is_empty() {
            return Vec::new();
        }

        let mut probes = JoinSet::new();
        for (publisher_id, url, seen) in due {
            let probe = Arc::clone(&state.probe);
            let timeout = state.probe_timeout;
            probes.spawn(async move {
                let result = match tokio::time::timeout(timeout, probe.probe(&url)).await {
                    Ok(result) => result,
                    Err(_) => Err(SchemaError::Timeout {
                        operation: format!("liveness probe to {}", url),
                        timeout,
                    }),
                };
                (publisher_id, seen, result)
            });
        }

        let mut lost = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (publisher_id, seen, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Liveness probe task failed");
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    state.ping(&publisher_id);
                }
                Err(e) => {
                    // A submission during the probe proves liveness
                    let refreshed = state
                        .publishers
                        .lock()
                        .get(&publisher_id)
                        .map(|t| t.last_ping > seen)
                        .unwrap_or(false);
                    if refreshed {
                        continue;
                    }
                    if state.terminate(&publisher_id, &e.to_string()).is_some() {
                        lost.push(publisher_id);
                    }
                }
            }
        }
        lost
    }
}
