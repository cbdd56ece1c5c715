//! Acknowledgment router.
//!
//! Demultiplexes the transport's shared inbound stream to pending
//! operations. Each dispatch registers a route for its correlation id, which
//! subscribes `ack/{id}`. The router itself only finalizes; the dispatch that
//! owns a route releases it exactly once, and releasing unsubscribes the
//! topic.
//!
//! Subscribe and unsubscribe for one id are serialized by a per-id lock, and
//! a route is owned by a single [`PendingOperation`]. A release that runs
//! after a later dispatch already registered the same id leaves that
//! dispatch's subscription in place.
//!
//! Messages on a topic with no route, or for an operation that is already
//! terminal, are discarded. A late ack racing a timeout is expected and is
//! not an error.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::pending::{Finalization, PendingOperation, PendingTable};
use crate::store::RecordStore;
use crate::transport::{ack_topic, correlation_from_topic, BusMessage, BusTransport};

struct Route {
    owner: Arc<PendingOperation>,
    topic: String,
}

/// Routes acknowledgments to pending operations.
pub struct AckRouter {
    transport: Arc<dyn BusTransport>,
    pending: Arc<PendingTable>,
    records: RecordStore,
    /// correlation id -> owning operation
    routes: DashMap<String, Route>,
    /// correlation id -> lock held across subscribe/unsubscribe
    subscriptions: DashMap<String, Arc<Mutex<()>>>,
}

impl AckRouter {
    /// Create the router and start its pump on the current runtime.
    ///
    /// The pump only holds a weak reference; it exits once the router is
    /// dropped or the transport's inbound channel closes.
    pub fn start(
        transport: Arc<dyn BusTransport>,
        pending: Arc<PendingTable>,
        records: RecordStore,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let inbound = transport.messages();
        let router = Arc::new(Self {
            transport,
            pending,
            records,
            routes: DashMap::new(),
            subscriptions: DashMap::new(),
        });
        let pump = tokio::spawn(pump(Arc::downgrade(&router), inbound));
        (router, pump)
    }

    /// Route acks for `op`'s correlation id to `op` and subscribe its topic.
    pub async fn register(&self, op: &Arc<PendingOperation>) -> Result<(), TransportError> {
        let id = op.correlation_id();
        let topic = ack_topic(id);
        let lock = self.subscription_lock(id);
        let _held = lock.lock().await;

        self.routes.insert(
            id.to_string(),
            Route {
                owner: op.clone(),
                topic: topic.clone(),
            },
        );

        if let Err(e) = self.transport.subscribe(&topic).await {
            self.routes
                .remove_if(id, |_, route| Arc::ptr_eq(&route.owner, op));
            return Err(e);
        }
        Ok(())
    }

    /// Release `op`'s route and unsubscribe its topic.
    ///
    /// Returns `true` for the call that released it; later calls, and calls
    /// for an operation that no longer owns the route, are no-ops. The topic
    /// stays subscribed if another operation registered the id meanwhile.
    pub async fn release(&self, op: &Arc<PendingOperation>) -> bool {
        let id = op.correlation_id();
        let Some((_, route)) = self
            .routes
            .remove_if(id, |_, route| Arc::ptr_eq(&route.owner, op))
        else {
            return false;
        };

        let lock = self.subscription_lock(id);
        {
            let _held = lock.lock().await;
            if self.routes.contains_key(id) {
                debug!(record_id = %id, "id registered again, keeping subscription");
            } else if let Err(e) = self.transport.unsubscribe(&route.topic).await {
                warn!(record_id = %id, topic = %route.topic, error = %e, "unsubscribe failed");
            }
        }
        drop(lock);

        self.subscriptions.remove_if(id, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.routes.contains_key(id)
        });
        true
    }

    /// Like [`release`](Self::release), but runs on a spawned task so the
    /// unsubscribe completes even if the caller is dropped.
    ///
    /// Returns `None` if `op` does not own a route.
    pub fn release_detached(self: &Arc<Self>, op: &Arc<PendingOperation>) -> Option<JoinHandle<()>> {
        if !self.is_owned_by(op) {
            return None;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let router = self.clone();
                let op = op.clone();
                Some(handle.spawn(async move {
                    router.release(&op).await;
                }))
            }
            Err(_) => {
                self.routes
                    .remove_if(op.correlation_id(), |_, route| Arc::ptr_eq(&route.owner, op));
                warn!(
                    record_id = %op.correlation_id(),
                    "no runtime to unsubscribe on, subscription left to the transport"
                );
                None
            }
        }
    }

    pub fn is_routed(&self, correlation_id: &str) -> bool {
        self.routes.contains_key(correlation_id)
    }

    /// Number of live routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn is_owned_by(&self, op: &Arc<PendingOperation>) -> bool {
        self.routes
            .get(op.correlation_id())
            .is_some_and(|route| Arc::ptr_eq(&route.owner, op))
    }

    fn subscription_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.subscriptions
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Handle one inbound message.
    ///
    /// Never waits on the transport, so a slow unsubscribe for one id cannot
    /// hold up acks for another.
    pub(crate) fn route(&self, message: &BusMessage) {
        let Some(id) = correlation_from_topic(&message.topic) else {
            return;
        };
        let Some(op) = self.routes.get(id).map(|route| route.owner.clone()) else {
            debug!(record_id = %id, "ack without a route, discarding");
            return;
        };
        if op.is_terminal() {
            debug!(record_id = %id, "ack after finalization, discarding");
            return;
        }

        let records = &self.records;
        let accepted = self.pending.finalize(&op, Finalization::Acked, |op| {
            records.upsert(op.correlation_id(), op.record().clone());
        });

        if accepted {
            info!(
                record_id = %id,
                operation = %op.operation(),
                attempts = op.attempts(),
                "record processed"
            );
        } else {
            debug!(record_id = %id, "ack lost the race to another finalization, discarding");
        }
    }
}

impl std::fmt::Debug for AckRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckRouter")
            .field("routes", &self.routes.len())
            .finish()
    }
}

async fn pump(router: Weak<AckRouter>, mut inbound: tokio::sync::broadcast::Receiver<BusMessage>) {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                warn!(lagged = n, "ack router lagged, acknowledgments may be missed");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let Some(router) = router.upgrade() else {
            return;
        };
        router.route(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::pending::Phase;
    use crate::record::{OperationType, Record};
    use crate::testing::TestTransport;
    use bytes::Bytes;
    use std::time::Duration;

    fn record(id: &str) -> Record {
        Record {
            record_id: id.to_string(),
            user_id: "u1".into(),
            org: "o1".into(),
            emission_gas_name: "CO2".into(),
            quantity: 100.0,
            unit: "kg".into(),
        }
    }

    fn setup() -> (InMemoryBroker, Arc<AckRouter>, Arc<PendingTable>, RecordStore) {
        let broker = InMemoryBroker::new();
        let transport: Arc<dyn BusTransport> = Arc::new(broker.connect());
        let pending = Arc::new(PendingTable::new());
        let records = RecordStore::new();
        let (router, _pump) = AckRouter::start(transport, pending.clone(), records.clone());
        (broker, router, pending, records)
    }

    fn setup_slow_unsubscribe(
        delay: Duration,
    ) -> (InMemoryBroker, Arc<TestTransport>, Arc<AckRouter>, Arc<PendingTable>) {
        let broker = InMemoryBroker::new();
        let transport = Arc::new(TestTransport::new(&broker));
        transport.set_unsubscribe_delay(delay);
        let pending = Arc::new(PendingTable::new());
        let (router, _pump) =
            AckRouter::start(transport.clone(), pending.clone(), RecordStore::new());
        (broker, transport, router, pending)
    }

    #[tokio::test]
    async fn test_ack_commits_and_leaves_release_to_owner() {
        let (broker, router, pending, records) = setup();
        let (op, rx) = pending.create(record("r1"), OperationType::Create).unwrap();

        router.register(&op).await.unwrap();
        assert_eq!(broker.subscriber_count("ack/r1"), 1);

        router.route(&BusMessage::new("ack/r1", Bytes::from_static(b"{}")));

        assert_eq!(rx.await.unwrap(), Finalization::Acked);
        assert_eq!(op.phase(), Phase::Acked);
        assert!(records.contains("r1"));
        assert!(pending.is_empty());
        assert!(router.is_routed("r1"));

        assert!(router.release(&op).await);
        assert!(!router.is_routed("r1"));
        assert_eq!(broker.subscriber_count("ack/r1"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_discarded() {
        let (_broker, router, pending, records) = setup();
        let (op, _rx) = pending.create(record("r1"), OperationType::Create).unwrap();
        router.register(&op).await.unwrap();

        let ack = BusMessage::new("ack/r1", Bytes::new());
        router.route(&ack);
        router.route(&ack);

        assert_eq!(records.get_stored("r1").unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_ack_for_terminal_operation_is_discarded() {
        let (_broker, router, pending, records) = setup();
        let (op, _rx) = pending.create(record("r1"), OperationType::Create).unwrap();
        router.register(&op).await.unwrap();

        // Timeout won; the route is still live until the dispatcher releases it.
        assert!(pending.finalize(&op, Finalization::Failed, |_| {}));
        router.route(&BusMessage::new("ack/r1", Bytes::new()));

        assert!(!records.contains("r1"));
        assert_eq!(op.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_release_is_exactly_once() {
        let (broker, router, pending, _records) = setup();
        let (op, _rx) = pending.create(record("r1"), OperationType::Create).unwrap();
        router.register(&op).await.unwrap();

        assert!(router.release(&op).await);
        assert!(!router.release(&op).await);
        assert!(router.release_detached(&op).is_none());
        assert_eq!(broker.subscriber_count("ack/r1"), 0);
        assert_eq!(router.route_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_successor_subscription() {
        let (broker, router, pending, _records) = setup();
        let (first, _rx) = pending.create(record("r1"), OperationType::Update).unwrap();
        router.register(&first).await.unwrap();
        assert!(pending.finalize(&first, Finalization::Acked, |_| {}));

        let (second, rx) = pending.create(record("r1"), OperationType::Update).unwrap();
        router.register(&second).await.unwrap();

        assert!(!router.release(&first).await);
        assert_eq!(broker.subscriber_count("ack/r1"), 1);

        broker.publish("ack/r1", Bytes::new());
        assert_eq!(rx.await.unwrap(), Finalization::Acked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_waits_for_in_flight_unsubscribe() {
        let (broker, transport, router, pending) =
            setup_slow_unsubscribe(Duration::from_millis(5));
        let (first, _rx) = pending.create(record("r1"), OperationType::Update).unwrap();
        router.register(&first).await.unwrap();
        assert!(pending.finalize(&first, Finalization::Acked, |_| {}));

        let release = router.release_detached(&first).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.unsubscriptions(), vec!["ack/r1".to_string()]);

        let (second, rx) = pending.create(record("r1"), OperationType::Update).unwrap();
        router.register(&second).await.unwrap();
        release.await.unwrap();

        assert!(router.is_routed("r1"));
        assert_eq!(transport.active_topics(), vec!["ack/r1".to_string()]);
        assert_eq!(broker.publish("ack/r1", Bytes::new()), 1);
        assert_eq!(rx.await.unwrap(), Finalization::Acked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_unsubscribe_does_not_delay_other_acks() {
        let (broker, _transport, router, pending) =
            setup_slow_unsubscribe(Duration::from_secs(1));
        let (a, rx_a) = pending.create(record("a"), OperationType::Create).unwrap();
        let (b, rx_b) = pending.create(record("b"), OperationType::Create).unwrap();
        router.register(&a).await.unwrap();
        router.register(&b).await.unwrap();

        broker.publish("ack/a", Bytes::new());
        assert_eq!(rx_a.await.unwrap(), Finalization::Acked);
        let release_a = router.release_detached(&a).unwrap();

        broker.publish("ack/b", Bytes::new());
        let acked = tokio::time::timeout(Duration::from_millis(10), rx_b).await;
        assert_eq!(acked.unwrap().unwrap(), Finalization::Acked);
        assert!(!release_a.is_finished());
        assert_eq!(b.phase(), Phase::Acked);
    }

    #[tokio::test]
    async fn test_pump_delivers_from_bus() {
        let (broker, router, pending, records) = setup();
        let (op, rx) = pending.create(record("r1"), OperationType::Create).unwrap();
        router.register(&op).await.unwrap();

        broker.publish("ack/r1", Bytes::from_static(b"ok"));

        assert_eq!(rx.await.unwrap(), Finalization::Acked);
        assert!(records.contains("r1"));
    }

    #[tokio::test]
    async fn test_unrouted_topics_are_ignored() {
        let (_broker, router, pending, records) = setup();
        let (op, _rx) = pending.create(record("r1"), OperationType::Create).unwrap();

        router.route(&BusMessage::new("ack/r1", Bytes::new()));
        router.route(&BusMessage::new("auditQueue", Bytes::new()));

        assert!(!op.is_terminal());
        assert!(!records.contains("r1"));
    }
}
