//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the progress store and the archive index.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("failed to replace snapshot {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("storage lock poisoned")]
    LockPoisoned,
}
