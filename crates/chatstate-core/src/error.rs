//! Error types for the state engine

use std::sync::Arc;
use thiserror::Error;

/// State engine error types.
///
/// Variants are cheap to clone so that single-flight cache loads can hand the
/// same error to every joined waiter.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The pool's wait queue is full or the acquire timed out. Transient;
    /// callers may retry with backoff or fall back to an uncached read.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A connection was checked in twice. Programming error, never swallowed.
    #[error("connection {0} released twice")]
    DoubleRelease(u64),

    /// A cache loader raised. Shared identically by every waiter that joined
    /// the in-flight load.
    #[error("cache load failed: {0}")]
    LoadFailed(Arc<anyhow::Error>),

    /// The stream no longer accepts fragments.
    #[error("stream closed for conversation {0}")]
    StreamClosed(String),

    /// The delivery collaborator rejected a flush permanently.
    #[error("delivery failed permanently for conversation {conversation}: {reason}")]
    DeliveryPermanent { conversation: String, reason: String },

    /// Transient delivery failures exhausted the retry budget.
    #[error("delivery failed after {attempts} attempts for conversation {conversation}")]
    RetriesExhausted { conversation: String, attempts: u32 },

    /// A provider client could not be constructed.
    #[error("provider {name} unavailable: {reason}")]
    ProviderUnavailable { name: String, reason: String },

    /// Storage-level failure surfaced through the pool or a loader.
    #[error("storage error: {0}")]
    Storage(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Storage(Arc::new(err))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CoreError>;
