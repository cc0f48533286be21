//! Error taxonomy for the reconciliation pipeline.
//!
//! Policy: per-file failures are logged and skipped (the file stays out of
//! the ledger and is retried next run); per-group failures leave the group
//! retryable; input validation aborts the run before anything is scanned.

use std::path::PathBuf;

/// Pipeline result type
pub type Result<T> = std::result::Result<T, DnaError>;

/// Pipeline error types
#[derive(Debug, thiserror::Error)]
pub enum DnaError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error at {path}: {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("malformed header in {path}: {message}")]
    Header { path: PathBuf, message: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DnaError {
    /// Shorthand for input-validation failures.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}
