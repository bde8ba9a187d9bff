//! The set of tracked conversations.

use chatvault_types::{ConversationId, ConversationInfo, ConversationKind};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Tracked conversations keyed by ID, minus any explicit exclusions.
#[derive(Clone, Debug, Default)]
pub struct ConversationDirectory {
    entries: BTreeMap<ConversationId, ConversationInfo>,
}

impl ConversationDirectory {
    pub fn new(conversations: impl IntoIterator<Item = ConversationInfo>) -> Self {
        Self::with_exclusions(conversations, &HashSet::new())
    }

    pub fn with_exclusions(
        conversations: impl IntoIterator<Item = ConversationInfo>,
        excluded: &HashSet<ConversationId>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for info in conversations {
            if excluded.contains(&info.id) {
                info!("excluding conversation {}", info.id);
                continue;
            }
            entries.insert(info.id, info);
        }
        Self { entries }
    }

    pub fn ids(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.entries.keys().copied()
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationInfo> {
        self.entries.get(&id)
    }

    /// Pacing kind of a conversation; unknown conversations pace as chats.
    pub fn kind(&self, id: ConversationId) -> ConversationKind {
        self.get(id).map(|c| c.kind).unwrap_or_default()
    }

    pub fn title(&self, id: ConversationId) -> String {
        self.get(id).map(|c| c.title.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
