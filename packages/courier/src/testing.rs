//! Test doubles for dispatch scenarios.
//!
//! Only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! courier = { path = "../courier", features = ["testing"] }
//! ```
//!
//! [`TestTransport`] wraps a real [`InMemoryClient`] so delivery behaves
//! normally, while recording every publish and subscription change and
//! optionally failing publishes or slowing unsubscribes on demand.
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let transport = Arc::new(TestTransport::new(&broker));
//! transport.fail_next_publishes(2);
//!
//! let dispatcher = Dispatcher::new(transport.clone());
//! // ...
//! assert_eq!(transport.publish_count_for("auditQueue"), 5);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::memory::{InMemoryBroker, InMemoryClient};
use crate::probe::LivenessProbe;
use crate::transport::{BusMessage, BusTransport};

/// A publish observed by [`TestTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Whether the publish was failed on purpose.
    pub failed: bool,
}

/// Recording transport over an [`InMemoryBroker`].
pub struct TestTransport {
    client: InMemoryClient,
    published: RwLock<Vec<PublishedMessage>>,
    subscriptions: RwLock<Vec<String>>,
    unsubscriptions: RwLock<Vec<String>>,
    failing_publishes: AtomicUsize,
    unsubscribe_delay_ms: AtomicU64,
}

impl TestTransport {
    pub fn new(broker: &InMemoryBroker) -> Self {
        Self {
            client: broker.connect(),
            published: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            unsubscriptions: RwLock::new(Vec::new()),
            failing_publishes: AtomicUsize::new(0),
            unsubscribe_delay_ms: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` publishes with [`TransportError::Rejected`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Delay every unsubscribe by `delay` before the topic is detached, like
    /// a broker round trip.
    pub fn set_unsubscribe_delay(&self, delay: Duration) {
        self.unsubscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every publish attempt, in order, failed ones included.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish attempts on `topic`, failed ones included.
    pub fn publish_count_for(&self, topic: &str) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .count()
    }

    /// Topics passed to `subscribe`, in call order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Topics passed to `unsubscribe`, in call order.
    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Topics currently subscribed on the underlying client.
    pub fn active_topics(&self) -> Vec<String> {
        self.client.subscribed_topics()
    }

    fn take_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BusTransport for TestTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let failed = self.take_failure();
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                failed,
            });

        if failed {
            return Err(TransportError::Rejected {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.client.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(topic.to_string());
        self.client.subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.unsubscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(topic.to_string());
        let delay = self.unsubscribe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.client.unsubscribe(topic).await
    }

    fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.client.messages()
    }
}

/// Probe whose answer is set by the test.
#[derive(Debug)]
pub struct StaticProbe {
    ready: AtomicBool,
}

impl StaticProbe {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
