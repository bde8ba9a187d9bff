//! Read-only view of the archive used by gap reconciliation.

use crate::error::{BackfillError, BackfillResult};
use async_trait::async_trait;
use chatvault_storage::ArchiveIndex;
use chatvault_types::{ConversationId, MessageId};

/// Lists what the downstream archive already holds.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    /// Archived message IDs of `conversation`, ascending and distinct.
    async fn list_archived_ids(&self, conversation: ConversationId) -> BackfillResult<Vec<MessageId>>;
}

#[async_trait]
impl ArchiveReader for ArchiveIndex {
    async fn list_archived_ids(&self, conversation: ConversationId) -> BackfillResult<Vec<MessageId>> {
        let index = self.clone();
        tokio::task::spawn_blocking(move || index.list_archived_ids(conversation))
            .await
            .map_err(|e| BackfillError::Task(format!("archive query panicked: {e}")))?
            .map_err(|e| BackfillError::Archive(e.to_string()))
    }
}
