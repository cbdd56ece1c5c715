//! Publish-retry scheduler.
//!
//! One scheduler task runs per pending operation:
//!
//! ```text
//! Idle ─► Publishing ─► Waiting ─┬─► Acked (terminal, set by the router)
//!             ▲                  │
//!             └── interval ──────┤
//!                                └─► Failed (terminal, after max_attempts)
//! ```
//!
//! A failed publish is logged and still spends one attempt. After the last
//! attempt the scheduler waits one more interval before failing the
//! operation, so exhaustion fires `max_attempts × interval` after the first
//! publish.
//!
//! The task stops as soon as the operation's [`RetryTimer`] is cancelled,
//! whichever terminal transition did it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pending::{Finalization, PendingOperation, PendingTable, Phase};
use crate::transport::BusTransport;

/// Attempt budget and spacing for re-publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);

    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Time from the first publish until an unacknowledged operation fails.
    pub fn total_budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_INTERVAL)
    }
}

/// Cancellable timer owned by a pending operation.
///
/// Every terminal transition goes through [`cancel`](Self::cancel). Only the
/// first call does anything; later calls return `false`.
#[derive(Debug, Default)]
pub struct RetryTimer {
    cancelled: AtomicBool,
    token: CancellationToken,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the timer. Returns `true` only for the call that stopped it.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Everything the scheduler task needs to re-publish one operation.
pub(crate) struct PublishJob {
    pub op: Arc<PendingOperation>,
    pub pending: Arc<PendingTable>,
    pub transport: Arc<dyn BusTransport>,
    pub topic: String,
    pub payload: Bytes,
    pub policy: RetryPolicy,
}

/// Start the retry loop for `job.op` on the current runtime.
pub(crate) fn spawn(job: PublishJob) -> JoinHandle<()> {
    tokio::spawn(run(job))
}

async fn run(job: PublishJob) {
    let PublishJob {
        op,
        pending,
        transport,
        topic,
        payload,
        policy,
    } = job;
    let token = op.timer().token();
    let record_id = op.correlation_id().to_string();

    loop {
        if token.is_cancelled() {
            return;
        }

        let attempt = op.begin_attempt();
        let published = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = transport.publish(&topic, payload.clone()) => result,
        };

        match published {
            Ok(()) => debug!(record_id = %record_id, attempt, topic = %topic, "published record"),
            Err(e) => warn!(
                record_id = %record_id,
                attempt,
                error = %e,
                "publish failed, attempt still counted"
            ),
        }
        op.advance(Phase::Publishing, Phase::Waiting);

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(policy.interval) => {}
        }

        if attempt >= policy.max_attempts {
            break;
        }
    }

    if pending.finalize(&op, Finalization::Failed, |_| {}) {
        warn!(
            record_id = %record_id,
            attempts = op.attempts(),
            "no acknowledgment, retries exhausted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_millis(2000));
        assert_eq!(policy.total_budget(), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_needs_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::from_millis(10)).max_attempts, 1);
    }

    #[test]
    fn test_timer_cancels_once() {
        let timer = RetryTimer::new();
        assert!(!timer.is_cancelled());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(timer.is_cancelled());
        assert!(timer.token().is_cancelled());
    }

    mod run {
        use super::*;
        use crate::memory::InMemoryBroker;
        use crate::record::{OperationType, Record};
        use crate::testing::TestTransport;

        fn record(id: &str) -> Record {
            Record {
                record_id: id.to_string(),
                user_id: "u1".into(),
                org: "o1".into(),
                emission_gas_name: "N2O".into(),
                quantity: 3.0,
                unit: "kg".into(),
            }
        }

        fn job(
            transport: Arc<TestTransport>,
            pending: &Arc<PendingTable>,
            op: &Arc<PendingOperation>,
        ) -> PublishJob {
            PublishJob {
                op: op.clone(),
                pending: pending.clone(),
                transport,
                topic: "auditQueue".into(),
                payload: Bytes::from_static(b"{}"),
                policy: RetryPolicy::new(3, Duration::from_millis(100)),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_exhaustion_fails_after_budget() {
            let transport = Arc::new(TestTransport::new(&InMemoryBroker::new()));
            let pending = Arc::new(PendingTable::new());
            let (op, rx) = pending.create(record("r1"), OperationType::Create).unwrap();

            let started = tokio::time::Instant::now();
            spawn(job(transport.clone(), &pending, &op)).await.unwrap();

            assert!(started.elapsed() >= Duration::from_millis(300));
            assert_eq!(rx.await.unwrap(), Finalization::Failed);
            assert_eq!(op.attempts(), 3);
            assert_eq!(op.phase(), Phase::Failed);
            assert_eq!(transport.publish_count_for("auditQueue"), 3);
            assert!(pending.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_cancelled_timer_stops_publishing() {
            let transport = Arc::new(TestTransport::new(&InMemoryBroker::new()));
            let pending = Arc::new(PendingTable::new());
            let (op, _rx) = pending.create(record("r1"), OperationType::Create).unwrap();

            let task = spawn(job(transport.clone(), &pending, &op));
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(pending.finalize(&op, Finalization::Acked, |_| {}));
            task.await.unwrap();

            assert_eq!(transport.publish_count_for("auditQueue"), 2);
            assert_eq!(op.phase(), Phase::Acked);
        }

        #[tokio::test(start_paused = true)]
        async fn test_failed_publish_spends_an_attempt() {
            let transport = Arc::new(TestTransport::new(&InMemoryBroker::new()));
            transport.fail_next_publishes(3);
            let pending = Arc::new(PendingTable::new());
            let (op, rx) = pending.create(record("r1"), OperationType::Create).unwrap();

            spawn(job(transport.clone(), &pending, &op)).await.unwrap();

            assert_eq!(rx.await.unwrap(), Finalization::Failed);
            assert_eq!(op.attempts(), 3);
            assert!(transport.published().iter().all(|m| m.failed));
        }
    }
}
