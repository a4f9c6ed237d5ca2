//! Common error types for the booking ledger

use thiserror::Error;

/// Common result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the booking ledger crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization error (wraps serde_json::Error)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Write rejected because the target slot changed or is already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persisted file exists but cannot be interpreted
    #[error("Corrupt data in {path}: {reason}")]
    CorruptData { path: String, reason: String },
}
