//! Error types for uniqued.

use thiserror::Error;

use crate::bus::ErrorCode;

/// Result type alias using uniqued's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for uniqued operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A submitted memfd is missing one or more of the required seals.
    #[error("memfd is missing required seals")]
    NotSealed,

    /// A wire frame could not be decoded.
    #[error("malformed wire frame: {0}")]
    Malformed(String),

    /// The remote end answered a method call with an error.
    #[error("method call failed: {code}: {message}")]
    Call {
        /// Error category reported by the daemon.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// A synchronous method call did not complete within its deadline.
    #[error("method call timed out")]
    Timeout,

    /// The connection to the daemon is gone.
    #[error("daemon connection closed")]
    Disconnected,

    /// The listening socket is already owned by another daemon.
    #[error("socket {0} is already in use (is another daemon running?)")]
    AlreadyRunning(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
