//! Common error types for A360

use thiserror::Error;

/// Common result type for A360 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the watcher and its adapters
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry store operation failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Registry store is exclusively locked by another process.
    /// Transient: callers retry with bounded backoff.
    #[error("Registry locked: {0}")]
    RegistryLocked(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that are expected to clear on their own (retry-worthy).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RegistryLocked(_))
    }
}
