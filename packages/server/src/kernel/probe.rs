//! HTTP liveness probe for the downstream processor.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier::LivenessProbe;
use reqwest::StatusCode;
use tracing::debug;

/// Request timeout for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ready iff `GET {url}` answers 200 within [`PROBE_TIMEOUT`].
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build probe HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(url = %self.url, error = %e, "liveness probe request failed");
                false
            }
        }
    }
}
