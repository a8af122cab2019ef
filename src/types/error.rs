//! Error taxonomy
//!
//! Every failure surfaced by the crate is classified into one of five
//! kinds, which drives the retry decision: transient failures are retried
//! with backoff, unknown failures are retried once, everything else fails
//! immediately.

use thiserror::Error;

/// Classification of a failure, used by the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Model or catalog entry absent. Never retried.
    NotFound,
    /// Memory or disk exhausted. Triggers an eviction attempt, not a retry.
    ResourceExhausted,
    /// Network error, timeout or rate limit. Retried with backoff.
    Transient,
    /// Authentication/authorization failure. Surfaced immediately.
    Auth,
    /// Anything unclassified. Retried once, conservatively.
    Unknown,
}

/// Crate-wide error type. Messages name the affected model or request id.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("unknown: {0}")]
    Unknown(String),
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            FleetError::Transient(_) => ErrorKind::Transient,
            FleetError::Auth(_) => ErrorKind::Auth,
            FleetError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the retry loop should attempt this operation again.
    pub fn retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}
