//! Bus transport seam.
//!
//! A [`BusTransport`] is one connection to a publish/subscribe bus, shared by
//! every concurrent dispatch. Messages for all topics the connection is
//! subscribed to arrive on a single inbound channel (see
//! [`BusTransport::messages`]); demultiplexing by correlation id is the
//! router's job, not the transport's.
//!
//! Transports are assumed to be at-least-once: a message may be delivered
//! more than once, or not at all, and nothing is deduplicated here.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Prefix of every correlation acknowledgment topic.
pub const ACK_TOPIC_PREFIX: &str = "ack/";

/// Acknowledgment topic for a correlation id: `ack/{id}`.
pub fn ack_topic(correlation_id: &str) -> String {
    format!("{ACK_TOPIC_PREFIX}{correlation_id}")
}

/// Correlation id carried by an acknowledgment topic, if `topic` is one.
pub fn correlation_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(ACK_TOPIC_PREFIX)
        .filter(|id| !id.is_empty())
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// One shared connection to a publish/subscribe bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Start receiving messages published to `topic` on [`messages`](Self::messages).
    ///
    /// Subscribing twice to the same topic is not an error and does not
    /// duplicate delivery.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Stop receiving messages for `topic`. Unknown topics are a no-op.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Inbound messages for every subscribed topic.
    ///
    /// Only messages received after this call are observed.
    fn messages(&self) -> broadcast::Receiver<BusMessage>;
}
