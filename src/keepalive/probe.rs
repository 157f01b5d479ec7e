//! Liveness probes

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{Result, SchemaError};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Succeeds only if the publisher answered as alive
    async fn probe(&self, url: &Url) -> Result<()>;
}

/// Issues a GET and treats any 2xx as alive
#[derive(Debug, Clone)]
pub struct HttpLivenessProbe {
    client: reqwest::Client,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, url: &Url) -> Result<()> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Liveness probe answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(SchemaError::Transport(format!(
                "liveness probe to {} returned {}",
                url, status
            )))
        }
    }
}
