//! NATS transport for the dispatch bus.
//!
//! One shared `async_nats::Client` carries every publish. Each subscribed
//! subject gets a forwarding task that copies its messages onto a single
//! inbound broadcast channel, which is what courier's ack router reads.
//! Unsubscribing aborts the forwarding task; dropping its `Subscriber` tells
//! the server to stop delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use courier::{BusMessage, BusTransport, TransportError};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the shared inbound channel.
const INBOUND_CAPACITY: usize = 1024;

/// [`BusTransport`] over a NATS connection.
pub struct NatsTransport {
    client: async_nats::Client,
    inbound: broadcast::Sender<BusMessage>,
    /// subject -> forwarding task
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NatsTransport {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {url}"))?;
        Ok(Self::new(client))
    }

    pub fn new(client: async_nats::Client) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            client,
            inbound,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Subjects with a live forwarding task.
    pub fn subscribed_subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        subjects.sort();
        subjects
    }

    fn is_subscribed(&self, subject: &str) -> bool {
        self.forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(subject)
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| TransportError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.is_subscribed(topic) {
            return Ok(());
        }

        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let inbound = self.inbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                // No receivers just means nobody is listening yet.
                let _ = inbound.send(BusMessage::new(
                    message.subject.to_string(),
                    message.payload,
                ));
            }
        });

        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        if forwarders.contains_key(topic) {
            // Lost a race with a concurrent subscribe to the same subject.
            forwarder.abort();
        } else {
            debug!(topic = %topic, "subscribed");
            forwarders.insert(topic.to_string(), forwarder);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let forwarder = self
            .forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic);
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            debug!(topic = %topic, "unsubscribed");
        }
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.inbound.subscribe()
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        let forwarders = std::mem::take(
            self.forwarders
                .get_mut()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !forwarders.is_empty() {
            warn!(count = forwarders.len(), "dropping NATS transport with live subscriptions");
        }
        for (_, forwarder) in forwarders {
            forwarder.abort();
        }
    }
}
