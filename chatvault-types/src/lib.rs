//! Core identifiers and records shared by the chatvault crates.
//!
//! - [`ConversationId`] keys every piece of per-conversation state
//! - [`GapRange`] is an inclusive interval of message IDs missing from the archive
//! - [`HistoryMessage`] is what the chat-history source returns
//! - [`RecoveredMessage`] is what the engine hands to its sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Message identifier inside a conversation's ID space.
///
/// IDs are positive and grow with time; `1` is the first possible message.
pub type MessageId = i64;

/// Stable key for a chat, channel or direct conversation.
///
/// Channel-style conversations use negative identifiers, so this is signed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl ConversationId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(ConversationId)
    }
}

impl From<i64> for ConversationId {
    fn from(value: i64) -> Self {
        ConversationId(value)
    }
}

/// Inclusive range of message IDs known upstream but absent from the archive.
///
/// Serialized as a `[start, end]` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "[MessageId; 2]", try_from = "[MessageId; 2]")]
pub struct GapRange {
    start: MessageId,
    end: MessageId,
}

impl GapRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: MessageId, end: MessageId) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> MessageId {
        self.start
    }

    pub fn end(&self) -> MessageId {
        self.end
    }

    /// Number of message IDs covered by the range.
    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64 + 1
    }

    /// Always false: construction rejects inverted bounds.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.start <= id && id <= self.end
    }

    /// The part of this range at or below `end`, if any is left.
    pub fn truncated_to(&self, end: MessageId) -> Option<Self> {
        Self::new(self.start, end.min(self.end))
    }
}

impl fmt::Display for GapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

impl From<GapRange> for [MessageId; 2] {
    fn from(range: GapRange) -> Self {
        [range.start, range.end]
    }
}

impl TryFrom<[MessageId; 2]> for GapRange {
    type Error = String;

    fn try_from([start, end]: [MessageId; 2]) -> Result<Self, Self::Error> {
        GapRange::new(start, end).ok_or_else(|| format!("inverted gap range [{start}, {end}]"))
    }
}

/// Kind of conversation, used to pick a pacing profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    #[default]
    Chat,
    Channel,
}

/// Tracked conversation as known to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    #[serde(default)]
    pub kind: ConversationKind,
    #[serde(default)]
    pub title: String,
}

impl ConversationInfo {
    pub fn new(id: impl Into<ConversationId>, kind: ConversationKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
        }
    }
}

/// A single message as returned by the chat-history source.
///
/// The payload is opaque to the engine and forwarded untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl HistoryMessage {
    pub fn new(id: MessageId, date: DateTime<Utc>) -> Self {
        Self {
            id,
            date,
            payload: serde_json::Value::Null,
        }
    }
}

/// Why a message was recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryKind {
    /// Fetched to close a hole between archived messages.
    #[serde(rename = "missing_message")]
    GapFill,
    /// Fetched while walking history backwards from the cursor.
    #[serde(rename = "backfill_message")]
    Backfill,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GapFill => write!(f, "gap-fill"),
            Self::Backfill => write!(f, "backfill"),
        }
    }
}

/// Record handed to the sink for every recovered message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveredMessage {
    #[serde(rename = "event_type")]
    pub kind: RecoveryKind,
    pub conversation: ConversationId,
    #[serde(default)]
    pub conversation_title: String,
    pub message: HistoryMessage,
    pub recovered_at: DateTime<Utc>,
}
