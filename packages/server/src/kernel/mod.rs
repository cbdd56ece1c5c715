//! Kernel module - server infrastructure and dependencies.

pub mod audit_processor;
pub mod deps;
pub mod nats;
pub mod probe;

pub use audit_processor::AuditProcessor;
pub use deps::ServerDeps;
pub use nats::NatsTransport;
pub use probe::{HttpProbe, PROBE_TIMEOUT};
