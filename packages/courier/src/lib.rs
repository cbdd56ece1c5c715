//! # Courier
//!
//! Acknowledged command dispatch over a publish/subscribe bus.
//!
//! A caller submits a record mutation; courier publishes it to an audit
//! topic, waits for the downstream processor to acknowledge it on
//! `ack/{recordId}`, and only then commits the record locally. Publishes are
//! retried on a fixed interval until an ack arrives or attempts run out.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher::dispatch(raw)
//!     │
//!     ├─► validate ─► PendingTable::create ─► AckRouter::register (ack/{id})
//!     │
//!     ├─► scheduler ──publish──► audit topic ──► processor
//!     │       ▲  every interval, up to max_attempts       │
//!     │       └─ RetryTimer cancelled on finalize         │
//!     │                                                   ▼
//!     └─◄ outcome ◄── PendingTable::finalize ◄── AckRouter ◄── ack/{id}
//!                           │
//!                           └─► RecordStore::upsert (ack only)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One pending operation per record id** - a second dispatch for the
//!    same id fails with `Conflict` while the first is outstanding
//! 2. **Exactly one finalization** - ack, exhaustion and cancellation race;
//!    the first to flip the terminal flag wins and the rest are no-ops
//! 3. **Commit only on ack** - the store is never touched by a failed or
//!    cancelled dispatch
//! 4. **Ack routes are released once, by the dispatcher** - the router only
//!    finalizes; the dispatch that owns a route unsubscribes `ack/{id}`
//!    before it returns, and never tears down a later dispatch's subscription
//!
//! ## Guarantees
//!
//! - **At-least-once publish**: the processor may see the same record more
//!   than once and should treat it idempotently
//! - **In-memory only**: pending operations and the record store do not
//!   survive a restart
//! - **No reordering protection**: a late ack for an earlier dispatch of the
//!   same id is accepted by whichever dispatch is pending at the time

mod dispatch;
mod error;
mod memory;
mod pending;
mod probe;
mod record;
mod router;
mod scheduler;
mod store;
mod transport;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export dispatcher types
pub use dispatch::{
    DispatchConfig, DispatchReceipt, Dispatcher, DispatcherBuilder, DEFAULT_AUDIT_TOPIC,
};

// Re-export error types
pub use error::{DispatchError, ErrorCategory, TransportError, ValidationError};

// Re-export record types
pub use record::{validate, OperationType, Record, RecordDraft, Submission, UserProjection};
pub use store::{RecordStore, StoredRecord};

// Re-export transport types
pub use memory::{InMemoryBroker, InMemoryClient};
pub use transport::{ack_topic, correlation_from_topic, BusMessage, BusTransport, ACK_TOPIC_PREFIX};

// Re-export coordination types
pub use pending::{Finalization, PendingOperation, PendingTable, Phase};
pub use probe::{AlwaysReady, LivenessProbe};
pub use router::AckRouter;
pub use scheduler::{RetryPolicy, RetryTimer};

// Re-export commonly used external types
pub use async_trait::async_trait;
