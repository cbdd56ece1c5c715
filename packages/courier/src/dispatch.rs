//! Dispatch coordinator.
//!
//! Turns one record submission into exactly one outcome:
//!
//! ```text
//! probe ─► validate ─► resolve id ─► pending.create ─► router.register
//!                                                           │
//!                                       scheduler::spawn ◄──┘
//!                                              │
//!              ┌───────────────┬───────────────┴──────────────┐
//!              ▼               ▼                              ▼
//!        ack (router)   retries exhausted            caller cancelled
//!         commit           Failed                      Cancelled
//! ```
//!
//! The three terminal paths race; the pending operation's terminal flag
//! picks the winner and every path ends by releasing the ack route.
//!
//! # Cancellation
//!
//! Use [`Dispatcher::dispatch_with_cancel`] to cancel explicitly. Dropping the
//! future returned by [`Dispatcher::dispatch`] also cancels: the in-flight
//! guard finalizes the operation as `Cancelled`, cancels its timer, and
//! releases the route on a spawned task.
//!
//! # Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let dispatcher = Dispatcher::builder(Arc::new(broker.connect()))
//!     .with_config(DispatchConfig::default())
//!     .build();
//!
//! let receipt = dispatcher.dispatch(json!({
//!     "userId": "u1", "org": "o1", "emissionGasName": "CO2",
//!     "quantity": 100, "unit": "kg"
//! })).await?;
//! assert_eq!(receipt.operation_type, OperationType::Create);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::pending::{Finalization, PendingOperation, PendingTable};
use crate::probe::LivenessProbe;
use crate::record::{validate, OperationType};
use crate::router::AckRouter;
use crate::scheduler::{self, PublishJob, RetryPolicy};
use crate::store::RecordStore;
use crate::transport::BusTransport;

/// Topic records are published on unless configured otherwise.
pub const DEFAULT_AUDIT_TOPIC: &str = "auditQueue";

/// Dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Topic the downstream processor consumes.
    pub audit_topic: String,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            audit_topic: DEFAULT_AUDIT_TOPIC.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Successful dispatch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub operation_type: OperationType,
    pub record_id: String,
}

impl DispatchReceipt {
    /// Human-readable confirmation.
    pub fn message(&self) -> String {
        format!(
            "Record successfully {} with id {}",
            self.operation_type, self.record_id
        )
    }
}

struct Shared {
    transport: Arc<dyn BusTransport>,
    records: RecordStore,
    pending: Arc<PendingTable>,
    router: Arc<AckRouter>,
    probe: Option<Arc<dyn LivenessProbe>>,
    config: DispatchConfig,
    pump: JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    transport: Arc<dyn BusTransport>,
    records: RecordStore,
    probe: Option<Arc<dyn LivenessProbe>>,
    config: DispatchConfig,
}

impl DispatcherBuilder {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            records: RecordStore::new(),
            probe: None,
            config: DispatchConfig::default(),
        }
    }

    /// Use an existing record store instead of an empty one.
    pub fn with_records(mut self, records: RecordStore) -> Self {
        self.records = records;
        self
    }

    /// Gate every dispatch on `probe`.
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dispatcher. Must be called inside a Tokio runtime: the ack
    /// router's pump is spawned here.
    pub fn build(self) -> Dispatcher {
        let pending = Arc::new(PendingTable::new());
        let (router, pump) =
            AckRouter::start(self.transport.clone(), pending.clone(), self.records.clone());

        Dispatcher {
            shared: Arc::new(Shared {
                transport: self.transport,
                records: self.records,
                pending,
                router,
                probe: self.probe,
                config: self.config,
                pump,
            }),
        }
    }
}

/// Submits record mutations over the bus and waits for their acknowledgment.
///
/// Cheap to clone; clones share the same store, pending table, and router.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn builder(transport: Arc<dyn BusTransport>) -> DispatcherBuilder {
        DispatcherBuilder::new(transport)
    }

    /// Dispatcher with default configuration, an empty store, and no probe.
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn records(&self) -> &RecordStore {
        &self.shared.records
    }

    pub fn pending(&self) -> &PendingTable {
        &self.shared.pending
    }

    pub fn router(&self) -> &AckRouter {
        &self.shared.router
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Number of outstanding dispatches.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Dispatch a raw submission and wait for its single outcome.
    pub async fn dispatch(&self, raw: Value) -> Result<DispatchReceipt, DispatchError> {
        self.dispatch_with_cancel(raw, CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), returning
    /// [`DispatchError::Cancelled`] if `cancel` fires before the operation
    /// finishes.
    pub async fn dispatch_with_cancel(
        &self,
        raw: Value,
        cancel: CancellationToken,
    ) -> Result<DispatchReceipt, DispatchError> {
        let shared = &self.shared;

        if let Some(probe) = &shared.probe {
            if !probe.is_ready().await {
                warn!("downstream processor not ready, rejecting dispatch");
                return Err(DispatchError::NotReady);
            }
        }

        let submission = validate(&raw)?;

        let (record_id, operation) = match submission.requested_id() {
            Some(id) => {
                if !shared.records.contains(id) {
                    return Err(DispatchError::NotFound(id.to_string()));
                }
                (id.to_string(), OperationType::Update)
            }
            None => (self.mint_record_id(), OperationType::Create),
        };

        let record = submission.draft.into_record(record_id.clone());
        let payload = Bytes::from(serde_json::to_vec(&record)?);
        let (op, mut outcome) = shared.pending.create(record, operation)?;
        let inflight = InflightGuard::new(shared.clone(), op.clone());

        if let Err(e) = shared.router.register(&op).await {
            warn!(record_id = %record_id, error = %e, "could not subscribe to ack topic");
            shared.pending.finalize(&op, Finalization::Failed, |_| {});
            inflight.complete().await;
            return Err(e.into());
        }

        debug!(record_id = %record_id, operation = %operation, "dispatching record");
        scheduler::spawn(PublishJob {
            op: op.clone(),
            pending: shared.pending.clone(),
            transport: shared.transport.clone(),
            topic: shared.config.audit_topic.clone(),
            payload,
            policy: shared.config.retry,
        });

        let finalization = tokio::select! {
            biased;
            result = &mut outcome => result.unwrap_or(Finalization::Cancelled),
            _ = cancel.cancelled() => {
                if shared.pending.finalize(&op, Finalization::Cancelled, |_| {}) {
                    Finalization::Cancelled
                } else {
                    // Something else finished first; report that instead.
                    outcome.await.unwrap_or(Finalization::Cancelled)
                }
            }
        };

        inflight.complete().await;

        match finalization {
            Finalization::Acked => Ok(DispatchReceipt {
                operation_type: operation,
                record_id,
            }),
            Finalization::Failed => Err(DispatchError::AckTimeout {
                record_id,
                attempts: op.attempts(),
            }),
            Finalization::Cancelled => {
                debug!(record_id = %record_id, "dispatch cancelled by caller");
                Err(DispatchError::Cancelled(record_id))
            }
        }
    }

    /// Fresh id that is neither committed nor pending.
    fn mint_record_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.shared.records.contains(&id) && !self.shared.pending.contains(&id) {
                return id;
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.in_flight())
            .field("records", &self.shared.records.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// RAII guard for one outstanding dispatch.
///
/// The dispatch is the only releaser of its ack route. `complete` releases
/// it and waits for the unsubscribe, so the caller sees the id free and
/// unsubscribed. If the dispatch future is dropped first, `Drop` cancels the
/// operation and releases the route in the background.
struct InflightGuard {
    shared: Arc<Shared>,
    op: Arc<PendingOperation>,
    armed: bool,
}

impl InflightGuard {
    fn new(shared: Arc<Shared>, op: Arc<PendingOperation>) -> Self {
        Self {
            shared,
            op,
            armed: true,
        }
    }

    async fn complete(mut self) {
        self.armed = false;
        // Spawned so the unsubscribe finishes even if we are dropped mid-await.
        if let Some(task) = self.shared.router.release_detached(&self.op) {
            let _ = task.await;
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self
            .shared
            .pending
            .finalize(&self.op, Finalization::Cancelled, |_| {})
        {
            debug!(record_id = %self.op.correlation_id(), "dispatch dropped, operation cancelled");
        }
        self.shared.router.release_detached(&self.op);
    }
}
