use anyhow::{bail, Context, Result};
use courier::{DispatchConfig, RetryPolicy, DEFAULT_AUDIT_TOPIC};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// NATS server; `None` runs on the in-process broker.
    pub nats_url: Option<String>,
    pub audit_topic: String,
    pub dispatch_max_attempts: u32,
    pub dispatch_retry_interval_ms: u64,
    /// Liveness endpoint of the downstream processor.
    pub health_probe_url: Option<String>,
    /// Run the built-in audit processor on its own bus connection.
    pub embedded_processor: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nats_url = lookup("NATS_URL").filter(|url| !url.is_empty());

        let dispatch_max_attempts: u32 = lookup("DISPATCH_MAX_ATTEMPTS")
            .unwrap_or_else(|| RetryPolicy::DEFAULT_MAX_ATTEMPTS.to_string())
            .parse()
            .context("DISPATCH_MAX_ATTEMPTS must be a valid number")?;
        if dispatch_max_attempts == 0 {
            bail!("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }

        let dispatch_retry_interval_ms: u64 = lookup("DISPATCH_RETRY_INTERVAL_MS")
            .unwrap_or_else(|| RetryPolicy::DEFAULT_INTERVAL.as_millis().to_string())
            .parse()
            .context("DISPATCH_RETRY_INTERVAL_MS must be a valid number")?;
        if dispatch_retry_interval_ms == 0 {
            bail!("DISPATCH_RETRY_INTERVAL_MS must be at least 1");
        }

        let embedded_processor = match lookup("EMBEDDED_PROCESSOR") {
            Some(value) => parse_bool(&value)
                .context("EMBEDDED_PROCESSOR must be true or false")?,
            None => nats_url.is_none(),
        };

        Ok(Self {
            port: lookup("PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            nats_url,
            audit_topic: lookup("AUDIT_TOPIC")
                .filter(|topic| !topic.is_empty())
                .unwrap_or_else(|| DEFAULT_AUDIT_TOPIC.to_string()),
            dispatch_max_attempts,
            dispatch_retry_interval_ms,
            health_probe_url: lookup("HEALTH_PROBE_URL").filter(|url| !url.is_empty()),
            embedded_processor,
        })
    }

    /// Dispatch settings for the courier dispatcher.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            audit_topic: self.audit_topic.clone(),
            retry: RetryPolicy::new(
                self.dispatch_max_attempts,
                Duration::from_millis(self.dispatch_retry_interval_ms),
            ),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("unrecognized boolean {other:?}"),
    }
}
