//! In-process publish/subscribe broker.
//!
//! Topic-keyed fan-out for single-process deployments and tests. Each
//! [`InMemoryClient`] is one "connection": it owns a broadcast channel that
//! receives every message published to the topics it subscribed to.
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let client = broker.connect();
//! let mut inbound = client.messages();
//!
//! client.subscribe("ack/r1").await?;
//! broker.publish("ack/r1", Bytes::from_static(b"{}"));
//!
//! let msg = inbound.recv().await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::transport::{BusMessage, BusTransport};

/// Default inbound buffer per client.
const DEFAULT_CAPACITY: usize = 1024;

type Subscribers = HashMap<u64, broadcast::Sender<BusMessage>>;

struct BrokerInner {
    topics: RwLock<HashMap<String, Subscribers>>,
    next_client: AtomicU64,
    capacity: usize,
}

/// In-process broker.
///
/// Thread-safe, cloneable. Clones share the same topic table.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker whose clients buffer up to `capacity` inbound messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    /// Open a new client connection.
    pub fn connect(&self) -> InMemoryClient {
        let (inbound, _) = broadcast::channel(self.inner.capacity);
        InMemoryClient {
            id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            inbound,
            topics: Mutex::new(HashSet::new()),
        }
    }

    /// Deliver a message to every client subscribed to `topic`.
    ///
    /// Returns the number of clients it was delivered to. No-op without
    /// subscribers.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };

        let message = BusMessage::new(topic, payload);
        subscribers
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    /// Number of clients subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn attach(&self, topic: &str, client: u64, tx: broadcast::Sender<BusMessage>) {
        self.inner
            .topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .insert(client, tx);
    }

    fn detach(&self, topic: &str, client: u64) {
        let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&client);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("topics", &self.topic_count())
            .finish()
    }
}

/// A connection to an [`InMemoryBroker`].
///
/// Dropping the client detaches it from every topic.
pub struct InMemoryClient {
    id: u64,
    broker: InMemoryBroker,
    inbound: broadcast::Sender<BusMessage>,
    topics: Mutex<HashSet<String>>,
}

impl InMemoryClient {
    /// The broker this client is connected to.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    /// Topics this client is currently subscribed to.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl BusTransport for InMemoryClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.broker.publish(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let newly_added = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());
        if newly_added {
            self.broker.attach(topic, self.id, self.inbound.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let removed = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic);
        if removed {
            self.broker.detach(topic, self.id);
        }
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.inbound.subscribe()
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        let topics = std::mem::take(self.topics.get_mut().unwrap_or_else(|e| e.into_inner()));
        for topic in topics {
            self.broker.detach(&topic, self.id);
        }
    }
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("id", &self.id)
            .field("topics", &self.subscribed_topics())
            .finish()
    }
}
