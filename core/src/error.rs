//! Error kinds surfaced from the core pipeline.
//!
//! Each variant corresponds to one of the HTTP status classes the server maps onto:
//! `InvalidInput` -> 400, `NotFound` -> 404, `Conflict` -> 409, `PreconditionFailed` ->
//! 412, `Transient` -> 503, `Internal` -> 500.

use thiserror::Error;

/// The result type used throughout `caronte-core`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad format name, out-of-range port, malformed regex, unknown
    /// rule-id, non-pcap upload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No such connection, rule, or session.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate rule name, duplicate session id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rule mutation attempted against a stale version.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Store unavailable, scan aborted by shutdown. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invariant violation. Logged with context by the caller; never silently masked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("invariant violation: {}", msg);
        Error::Internal(msg)
    }
}
