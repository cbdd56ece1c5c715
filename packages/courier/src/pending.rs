//! Pending operation tracking.
//!
//! The [`PendingTable`] holds at most one [`PendingOperation`] per record id.
//! An operation is in the table exactly while its dispatch is outstanding:
//! whichever path finalizes it (ack, exhaustion, caller cancellation) also
//! removes it.
//!
//! # Exactly-once finalization
//!
//! Ack delivery and retry exhaustion race on different tasks. Both call
//! [`PendingTable::finalize`], which flips the operation's terminal flag with
//! a compare-exchange. The first caller wins, cancels the retry timer, runs
//! its commit hook, and wakes the waiting dispatcher; every later caller gets
//! `false` and must do nothing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::DispatchError;
use crate::record::{OperationType, Record};
use crate::scheduler::RetryTimer;

/// Scheduler state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Publishing,
    Waiting,
    Acked,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Acked | Phase::Failed | Phase::Cancelled)
    }
}

/// How a pending operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// An acknowledgment was accepted and the record committed.
    Acked,
    /// Retries were exhausted, or the operation could not be started.
    Failed,
    /// The caller went away first.
    Cancelled,
}

impl Finalization {
    fn phase(&self) -> Phase {
        match self {
            Finalization::Acked => Phase::Acked,
            Finalization::Failed => Phase::Failed,
            Finalization::Cancelled => Phase::Cancelled,
        }
    }
}

/// Bookkeeping for one in-flight submission.
#[derive(Debug)]
pub struct PendingOperation {
    correlation_id: String,
    record: Record,
    operation: OperationType,
    attempts: AtomicU32,
    terminal: AtomicBool,
    phase: Mutex<Phase>,
    timer: RetryTimer,
    outcome: Mutex<Option<oneshot::Sender<Finalization>>>,
}

impl PendingOperation {
    fn new(record: Record, operation: OperationType) -> (Self, oneshot::Receiver<Finalization>) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            correlation_id: record.record_id.clone(),
            record,
            operation,
            attempts: AtomicU32::new(0),
            terminal: AtomicBool::new(false),
            phase: Mutex::new(Phase::Idle),
            timer: RetryTimer::new(),
            outcome: Mutex::new(Some(tx)),
        };
        (op, rx)
    }

    /// Correlation id; equal to the record id.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Snapshot of the record as submitted.
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Publish attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn timer(&self) -> &RetryTimer {
        &self.timer
    }

    /// Count a new attempt and enter `Publishing`. Returns the attempt number.
    pub(crate) fn begin_attempt(&self) -> u32 {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        self.advance(Phase::Idle, Phase::Publishing);
        self.advance(Phase::Waiting, Phase::Publishing);
        attempt
    }

    /// Move from `from` to `to` unless the phase has changed meanwhile.
    pub(crate) fn advance(&self, from: Phase, to: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == from {
            *phase = to;
        }
    }

    /// Single terminal transition. See the module docs.
    fn finalize(&self, outcome: Finalization, on_win: impl FnOnce(&Self)) -> bool {
        if self
            .terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.timer.cancel();
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = outcome.phase();
        on_win(self);

        let waiter = self
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = waiter {
            // The dispatcher may already be gone; nothing to report then.
            let _ = tx.send(outcome);
        }
        true
    }
}

/// In-flight operations keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<String, Arc<PendingOperation>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation for `record`.
    ///
    /// Fails with [`DispatchError::Conflict`] if an operation for the same id
    /// is outstanding; the existing one is left untouched. The returned
    /// receiver resolves with the operation's single [`Finalization`].
    pub fn create(
        &self,
        record: Record,
        operation: OperationType,
    ) -> Result<(Arc<PendingOperation>, oneshot::Receiver<Finalization>), DispatchError> {
        match self.entries.entry(record.record_id.clone()) {
            Entry::Occupied(occupied) => Err(DispatchError::Conflict(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let (op, rx) = PendingOperation::new(record, operation);
                let op = Arc::new(op);
                vacant.insert(op.clone());
                Ok((op, rx))
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<PendingOperation>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove whatever operation is registered under `id`.
    #[cfg(test)]
    pub(crate) fn remove(&self, id: &str) -> Option<Arc<PendingOperation>> {
        self.entries.remove(id).map(|(_, op)| op)
    }

    /// Remove `op` only if it is still the operation registered under its id.
    pub fn remove_if_same(&self, op: &Arc<PendingOperation>) -> bool {
        self.entries
            .remove_if(op.correlation_id(), |_, current| Arc::ptr_eq(current, op))
            .is_some()
    }

    /// Finalize `op` exactly once.
    ///
    /// Returns `true` for the winning caller, after `on_win` has run and the
    /// operation has left the table. Returns `false` without side effects if
    /// the operation was already terminal.
    pub fn finalize(
        &self,
        op: &Arc<PendingOperation>,
        outcome: Finalization,
        on_win: impl FnOnce(&PendingOperation),
    ) -> bool {
        let won = op.finalize(outcome, on_win);
        if won {
            self.remove_if_same(op);
        }
        won
    }

    /// Correlation ids of all outstanding operations.
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
