//! Publisher liveness
//!
//! Push publishers can disappear without notice. Each publisher declares a
//! [`KeepAliveStrategy`]: either the registry polls a liveness URL, or the
//! transport reports when the publisher's connection closes. The
//! [`KeepAliveMonitor`] tracks when each publisher was last seen and emits
//! the publisher's configuration on its `terminated` channel once it is
//! considered lost.

mod monitor;
mod probe;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub use monitor::KeepAliveMonitor;
pub use probe::{HttpLivenessProbe, LivenessProbe};

/// Opaque id assigned to a transport connection
pub type ConnectionId = String;

/// How the registry decides a publisher is still alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeepAliveStrategy {
    /// Never expires
    #[default]
    None,
    /// Probe `url` once `poll_frequency_secs` has passed since the last success
    HttpPoll { url: Url, poll_frequency_secs: u64 },
    /// Lost when the transport connection closes
    Connection { connection_id: ConnectionId },
}

impl KeepAliveStrategy {
    pub fn http_poll(url: Url, poll_frequency: Duration) -> Self {
        Self::HttpPoll {
            url,
            poll_frequency_secs: poll_frequency.as_secs(),
        }
    }

    pub fn is_monitored(&self) -> bool {
        !matches!(self, KeepAliveStrategy::None)
    }
}

/// A publisher's identity and keep-alive strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherConfiguration {
    pub publisher_id: String,
    #[serde(default)]
    pub keep_alive: KeepAliveStrategy,
}

impl PublisherConfiguration {
    pub fn new(publisher_id: impl Into<String>, keep_alive: KeepAliveStrategy) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            keep_alive,
        }
    }
}
