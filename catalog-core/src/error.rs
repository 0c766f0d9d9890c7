//! Error taxonomy shared across the catalog node crates.
//!
//! Mirrors the distinctions the coordination protocol actually cares about:
//! a transient I/O failure gets retried, a protocol conflict gets logged and
//! dropped, and a local invariant violation forces a catalog reload.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A call to the storage layer (add/cat/pin/pubsub) failed but may
    /// succeed on retry — network hiccup, timeout, temporary unavailability.
    #[error("transient storage I/O failure: {0}")]
    Transient(String),

    /// A peer's message conflicts with locally held state in a way that
    /// cannot be reconciled (stale term, hash mismatch, unknown session).
    #[error("protocol conflict: {0}")]
    ProtocolConflict(String),

    /// An operation that requires a quorum did not get one in time.
    #[error("quorum not reached: {0}")]
    QuorumFailure(String),

    /// A request was rejected by local policy (not leader, bad token).
    #[error("policy rejected request: {0}")]
    PolicyFailure(String),

    /// On-disk state violates an invariant the process relies on
    /// (corrupt catalog file, unreadable embedding).
    #[error("local invariant violation: {0}")]
    LocalInvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;
