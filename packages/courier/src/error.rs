//! Structured error types for dispatch.
//!
//! `DispatchError` is what a caller of [`Dispatcher::dispatch`] sees. Every
//! variant maps to an [`ErrorCategory`] so edges (HTTP, CLI) can pick a
//! response without string matching.
//!
//! `TransportError` is the bus-level failure. A failed publish never reaches
//! the caller directly: the retry scheduler logs it and spends one attempt.
//! Only a failed *subscribe* (before the first publish) surfaces as
//! `DispatchError::Transport`.
//!
//! [`Dispatcher::dispatch`]: crate::Dispatcher::dispatch

use std::fmt;

use thiserror::Error;

/// Failure reported by a [`BusTransport`](crate::BusTransport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the bus failed or was lost.
    #[error("bus connection failed: {0}")]
    Connection(String),

    /// The bus refused a publish.
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// Subscribing to a topic failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// The client was closed.
    #[error("bus client closed")]
    Closed,
}

/// A submitted payload did not have the expected shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {subject} format: {reason}")]
pub struct ValidationError {
    /// Which projection failed: `"record"` or `"user"`.
    pub subject: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn record(reason: impl fmt::Display) -> Self {
        Self {
            subject: "record",
            reason: reason.to_string(),
        }
    }

    pub(crate) fn user(reason: impl fmt::Display) -> Self {
        Self {
            subject: "user",
            reason: reason.to_string(),
        }
    }
}

/// Error returned by a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An update named a record id that has never been committed.
    #[error("record not found for update: {0}")]
    NotFound(String),

    /// Another dispatch for the same record id is still outstanding.
    #[error("an operation for record {0} is already in flight")]
    Conflict(String),

    /// The liveness probe reported the downstream processor as not ready.
    #[error("downstream processor is not ready")]
    NotReady,

    /// Retries were exhausted without an acknowledgment.
    #[error("no acknowledgment for record {record_id} after {attempts} attempts")]
    AckTimeout { record_id: String, attempts: u32 },

    /// The caller gave up before the dispatch reached a terminal outcome.
    #[error("dispatch for record {0} was cancelled")]
    Cancelled(String),

    /// Subscribing to the acknowledgment topic failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The record could not be encoded for the bus.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    /// Category used by edges to choose a response.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Validation(_) | DispatchError::Encode(_) => ErrorCategory::Validation,
            DispatchError::NotFound(_) => ErrorCategory::NotFound,
            DispatchError::Conflict(_) => ErrorCategory::Conflict,
            DispatchError::NotReady
            | DispatchError::AckTimeout { .. }
            | DispatchError::Transport(_) => ErrorCategory::Unavailable,
            DispatchError::Cancelled(_) => ErrorCategory::Cancelled,
        }
    }
}

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed caller payload. Never retried.
    Validation,
    /// Update target does not exist.
    NotFound,
    /// Duplicate in-flight id.
    Conflict,
    /// Processor not ready, bus unavailable, or retries exhausted.
    Unavailable,
    /// Caller went away.
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Unavailable => write!(f, "service_unavailable"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
        }
    }
}
