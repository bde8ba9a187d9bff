//! Commands read from stdin, one JSON object per line.
//!
//! ```json
//! {"action": "SET_BACKFILL", "chat_id": 42, "offset_id": 1200}
//! {"action": "LIVE_MESSAGE", "chat_id": 42, "event_type": "edited_message",
//!  "message": {"id": 1301, "date": "2026-10-19T08:00:00Z"}}
//! ```
//!
//! Live messages come from whatever follows the conversations in real time.
//! They feed the activity tracker so backfill yields to live traffic.

use anyhow::{Context, Result};
use chatvault_backfill::{ActivityTracker, ConversationDirectory};
use chatvault_storage::ArchiveIndex;
use chatvault_types::{ConversationId, HistoryMessage, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Operator override of a conversation's backfill cursor.
    SetBackfill {
        chat_id: ConversationId,
        offset_id: MessageId,
    },
    LiveMessage {
        chat_id: ConversationId,
        #[serde(default)]
        event_type: LiveEvent,
        message: HistoryMessage,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEvent {
    #[default]
    NewMessage,
    EditedMessage,
}

/// Live message as published downstream, next to recovered ones.
#[derive(Debug, Serialize)]
pub struct LiveRecord {
    pub event_type: LiveEvent,
    pub conversation: ConversationId,
    pub conversation_title: String,
    pub message: HistoryMessage,
    pub received_at: DateTime<Utc>,
}

pub fn parse_command(line: &str) -> Result<Command> {
    serde_json::from_str(line.trim()).with_context(|| format!("bad command {line:?}"))
}

/// Records live activity and indexes the message as archived.
///
/// Returns the record to publish, or `None` for untracked conversations.
pub async fn accept_live(
    activity: &ActivityTracker,
    archive: &ArchiveIndex,
    directory: &ConversationDirectory,
    conversation: ConversationId,
    event_type: LiveEvent,
    message: HistoryMessage,
) -> Option<LiveRecord> {
    let Some(info) = directory.get(conversation) else {
        debug!("ignoring live message for untracked conversation {conversation}");
        return None;
    };
    activity.record_activity();

    let index = archive.clone();
    let id = message.id;
    match tokio::task::spawn_blocking(move || index.record(conversation, id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to index live message {id} of {conversation}: {e}"),
        Err(e) => warn!("archive indexing task panicked for live message {id}: {e}"),
    }

    Some(LiveRecord {
        event_type,
        conversation,
        conversation_title: info.title.clone(),
        message,
        received_at: Utc::now(),
    })
}
