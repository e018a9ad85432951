//! Error types for coderun-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Session does not exist (or was already released)
    #[error("not found: {0}")]
    NotFound(String),

    /// Requester lacks ownership or scope
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Too many run requests
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until retry is allowed
        retry_after: Option<u64>,
    },

    /// Session or run capacity reached
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Request payload rejected
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Process runner error
    #[error("sandbox error: {0}")]
    Sandbox(#[from] coderun_sandbox::Error),

    /// Internal error (closed channels, poisoned locks)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
