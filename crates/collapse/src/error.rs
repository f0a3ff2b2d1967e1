//! Error taxonomy for collapsed executions.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Boxed error returned by a producer closure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What one execution resolved to: the upstream payload, or a terminal error.
///
/// This is the unit that gets published to the result cache, stored in
/// inflight records, and delivered over waiter channels, so the error arm
/// must be cheap to clone.
pub type Outcome = Result<Bytes, CollapseError>;

/// Every way an [`execute`](crate::Collapser::execute) call can fail.
///
/// `Backend`, `BackendTimeout` and `ProducerPanic` are *terminal* errors:
/// they are produced once per leader, fanned out to every waiter, and cached
/// for the full TTL exactly like a success (negative caching, so a backend
/// failure burst is absorbed instead of amplified). `Cancelled` and
/// `ShuttingDown` only ever describe the calling side and are never cached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollapseError {
    /// The caller's own cancellation fired before a result was available.
    #[error("caller cancelled")]
    Cancelled,

    /// The producer returned an error.
    #[error("backend call failed: {0}")]
    Backend(String),

    /// The producer outlived the engine-supplied deadline.
    #[error("backend call exceeded {0:?}")]
    BackendTimeout(Duration),

    /// The producer terminated abnormally; the panic payload is preserved
    /// so waiters see why their leader died.
    #[error("producer panicked: {0}")]
    ProducerPanic(String),

    /// The engine is draining; delivered to every outstanding waiter during
    /// shutdown and to any caller arriving afterwards.
    #[error("shutting down")]
    ShuttingDown,
}
