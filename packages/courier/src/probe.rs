//! Liveness gate for the downstream processor.

use async_trait::async_trait;

/// Binary ready/not-ready signal for the downstream processor.
///
/// Checked once at the start of every dispatch when configured. A not-ready
/// answer fails the dispatch before any pending operation is created.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Probe that always reports ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

#[async_trait]
impl LivenessProbe for AlwaysReady {
    async fn is_ready(&self) -> bool {
        true
    }
}
