//! Per-conversation mutual exclusion and cancellable waits.
//!
//! Reconciliation replaces a conversation's gap list wholesale, so it must
//! never overlap with a fill pass over the same conversation. Both loops take
//! the conversation's lock from [`ConversationLocks`] before touching its state.

use crate::error::{BackfillError, BackfillResult};
use chatvault_types::ConversationId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

type ConversationMutex = Arc<tokio::sync::Mutex<()>>;

/// Lazily populated table of async mutexes, one per conversation.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    table: Mutex<HashMap<ConversationId, ConversationMutex>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, conversation: ConversationId) -> ConversationMutex {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation)
            .or_default()
            .clone()
    }

    /// Waits for exclusive access to `conversation`, or for cancellation.
    pub async fn acquire(
        &self,
        conversation: ConversationId,
        cancel: &CancellationToken,
    ) -> BackfillResult<OwnedMutexGuard<()>> {
        let mutex = self.mutex_for(conversation);
        tokio::select! {
            guard = mutex.lock_owned() => Ok(guard),
            _ = cancel.cancelled() => Err(BackfillError::Cancelled),
        }
    }

    /// Non-blocking check, mostly useful in tests.
    pub fn is_locked(&self, conversation: ConversationId) -> bool {
        self.mutex_for(conversation).try_lock().is_err()
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> BackfillResult<()> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(BackfillError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(BackfillError::Cancelled),
    }
}
