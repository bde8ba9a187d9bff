//! Backfill engine error types.

use chatvault_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type BackfillResult<T> = Result<T, BackfillError>;

/// Errors that can occur while reconciling or backfilling history.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("rate limited by history source, retry in {wait_secs}s")]
    RateLimited { wait_secs: u64 },

    #[error("history source request failed: {0}")]
    Source(String),

    #[error("archive query failed: {0}")]
    Archive(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl BackfillError {
    /// True for the source's transient "slow down" signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Mandatory wait carried by a rate-limit signal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait_secs } => Some(Duration::from_secs(*wait_secs)),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
