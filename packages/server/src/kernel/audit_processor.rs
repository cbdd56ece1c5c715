//! Embedded audit processor.
//!
//! Stand-in for the downstream consumer of the audit topic. It logs every
//! record it receives and acknowledges it on `ack/{recordId}`. It runs on its
//! own bus connection, so it sees the audit topic exactly as a separate
//! service would.

use std::sync::Arc;

use bytes::Bytes;
use courier::{ack_topic, BusMessage, BusTransport, TransportError};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ack payload. Its content is never inspected.
const ACK_PAYLOAD: &[u8] = b"{}";

pub struct AuditProcessor {
    transport: Arc<dyn BusTransport>,
    topic: String,
}

impl AuditProcessor {
    pub fn new(transport: Arc<dyn BusTransport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    /// Subscribe to the audit topic and start processing in the background.
    ///
    /// The subscription is in place when this returns.
    pub async fn spawn(self) -> Result<JoinHandle<()>, TransportError> {
        let mut inbound = self.transport.messages();
        self.transport.subscribe(&self.topic).await?;
        info!(topic = %self.topic, "audit processor listening");

        Ok(tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => self.handle(&message).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(lagged = n, "audit processor lagged, records skipped");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    async fn handle(&self, message: &BusMessage) {
        if message.topic != self.topic {
            return;
        }

        let record_id = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(value) => match value.get("recordId").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => {
                    warn!(
                        payload = %String::from_utf8_lossy(&message.payload),
                        "audit record without recordId, dropping"
                    );
                    return;
                }
            },
            Err(e) => {
                warn!(error = %e, "audit payload is not JSON, dropping");
                return;
            }
        };

        info!(
            record_id = %record_id,
            payload = %String::from_utf8_lossy(&message.payload),
            "audit record received"
        );

        match self
            .transport
            .publish(&ack_topic(&record_id), Bytes::from_static(ACK_PAYLOAD))
            .await
        {
            Ok(()) => debug!(record_id = %record_id, "acknowledged"),
            Err(e) => warn!(record_id = %record_id, error = %e, "failed to publish ack"),
        }
    }
}
