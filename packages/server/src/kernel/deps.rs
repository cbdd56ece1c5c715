//! Server dependencies assembled from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier::{BusTransport, Dispatcher, InMemoryBroker, LivenessProbe};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::kernel::{AuditProcessor, HttpProbe, NatsTransport};

/// Long-lived services shared by the HTTP layer.
pub struct ServerDeps {
    pub dispatcher: Dispatcher,
    /// Embedded audit processor task, when enabled.
    pub processor: Option<JoinHandle<()>>,
}

impl ServerDeps {
    /// Connect the bus, build the dispatcher, and start the embedded
    /// processor if configured.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let broker = InMemoryBroker::new();

        let transport: Arc<dyn BusTransport> = match &config.nats_url {
            Some(url) => Arc::new(NatsTransport::connect(url).await?),
            None => Arc::new(broker.connect()),
        };

        let mut builder = Dispatcher::builder(transport).with_config(config.dispatch_config());
        if let Some(url) = &config.health_probe_url {
            let probe: Arc<dyn LivenessProbe> = Arc::new(HttpProbe::new(url.clone())?);
            builder = builder.with_probe(probe);
        }
        let dispatcher = builder.build();

        let processor = if config.embedded_processor {
            // Separate connection, as an external processor would have.
            let processor_transport: Arc<dyn BusTransport> = match &config.nats_url {
                Some(url) => Arc::new(NatsTransport::connect(url).await?),
                None => Arc::new(broker.connect()),
            };
            let task = AuditProcessor::new(processor_transport, config.audit_topic.clone())
                .spawn()
                .await
                .context("Failed to start embedded audit processor")?;
            Some(task)
        } else {
            None
        };

        Ok(Self {
            dispatcher,
            processor,
        })
    }
}

impl Drop for ServerDeps {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.take() {
            processor.abort();
        }
    }
}
