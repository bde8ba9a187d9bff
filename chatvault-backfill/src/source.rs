//! Chat-history source capability.

use crate::error::BackfillResult;
use async_trait::async_trait;
use chatvault_types::{ConversationId, HistoryMessage, MessageId};

/// Remote, rate-limited history of every tracked conversation.
///
/// Implementations signal transient throttling with
/// [`BackfillError::RateLimited`](crate::BackfillError::RateLimited); any other
/// error is treated as a transport failure for the current unit of work.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` messages with ID strictly below `before_id`, newest first.
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
        before_id: MessageId,
    ) -> BackfillResult<Vec<HistoryMessage>>;

    /// ID of the oldest message still retrievable, if the history is not empty.
    async fn fetch_earliest(&self, conversation: ConversationId) -> BackfillResult<Option<MessageId>>;
}
