// src/error.rs

//! Error types for pkgworker
//!
//! `Error` is the crate-internal error. It never crosses the IPC boundary
//! as-is: the daemon maps it to a problem+json response, and the worker maps
//! it to an [`ErrorCode`](crate::transaction::ErrorCode) on the transaction.

use thiserror::Error;

/// Errors produced by the daemon, the worker and the client
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Raw I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed input (wire payload, status line, enum value)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Caller is not permitted to perform the operation
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Authorization backend refused or failed
    #[error("Authorization failed: {0}")]
    AuthError(String),

    /// Operation not valid in the transaction's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown transaction or resource
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Download failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Could not start or talk to the install child
    #[error("Spawn error: {0}")]
    SpawnError(String),

    /// The package manager lock could not be taken
    #[error("Lock error: {0}")]
    LockError(String),

    /// The daemon is unreachable or answered with an error
    #[error("Daemon error: {0}")]
    DaemonError(String),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

/// A type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;
