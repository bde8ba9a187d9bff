//! Durable per-conversation backfill progress.
//!
//! The whole snapshot is rewritten on every mutation: the new state is built
//! on a copy, written to a temp file in the target directory, fsynced and
//! renamed over the previous snapshot. Only after the rename succeeds does the
//! in-memory state change, so readers never observe state that is not on disk.

use crate::error::{StorageError, StorageResult};
use crate::snapshot::{self, Conversations};
use chatvault_types::{ConversationId, GapRange, MessageId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Backfill state of one conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationProgress {
    /// Highest message ID not yet confirmed as backfilled. `<= 1` means done.
    pub cursor: Option<MessageId>,
    /// Known holes in the archive, as last computed or partially filled.
    pub gaps: Vec<GapRange>,
}

impl ConversationProgress {
    fn is_blank(&self) -> bool {
        self.cursor.is_none() && self.gaps.is_empty()
    }

    /// True when the cursor still points above the first message.
    pub fn needs_backfill(&self) -> bool {
        self.cursor.is_some_and(|c| c > 1)
    }
}

/// Snapshot-backed store of cursors and gap ranges.
///
/// All access goes through one coarse lock which is never held across an
/// `.await`.
pub struct ProgressStore {
    path: PathBuf,
    state: Mutex<Conversations>,
}

impl ProgressStore {
    /// Loads the snapshot at `path`.
    ///
    /// A missing or unreadable snapshot yields an empty store and a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path);
        debug!(
            "loaded progress for {} conversations from {}",
            state.len(),
            path.display()
        );
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Conversations> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cursor(&self, conversation: ConversationId) -> Option<MessageId> {
        self.lock().get(&conversation).and_then(|p| p.cursor)
    }

    pub fn set_cursor(&self, conversation: ConversationId, cursor: MessageId) -> StorageResult<()> {
        self.mutate(|state| {
            state.entry(conversation).or_default().cursor = Some(cursor);
        })
    }

    /// Gap ranges in the order they were stored; sorted by start after a reload.
    pub fn gap_ranges(&self, conversation: ConversationId) -> Vec<GapRange> {
        self.lock()
            .get(&conversation)
            .map(|p| p.gaps.clone())
            .unwrap_or_default()
    }

    /// Replaces the conversation's gap ranges wholesale.
    pub fn set_gap_ranges(
        &self,
        conversation: ConversationId,
        ranges: Vec<GapRange>,
    ) -> StorageResult<()> {
        self.mutate(|state| {
            state.entry(conversation).or_default().gaps = ranges;
        })
    }

    /// Sets cursor and gap ranges in a single durable write.
    pub fn set_progress(
        &self,
        conversation: ConversationId,
        progress: ConversationProgress,
    ) -> StorageResult<()> {
        self.mutate(|state| {
            state.insert(conversation, progress);
        })
    }

    /// Conversations whose cursor is present and above 1.
    pub fn conversations_with_cursor(&self) -> Vec<ConversationId> {
        self.lock()
            .iter()
            .filter(|(_, p)| p.needs_backfill())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Conversations with either backfill or gap work outstanding.
    pub fn conversations_needing_work(&self) -> Vec<ConversationId> {
        self.lock()
            .iter()
            .filter(|(_, p)| p.needs_backfill() || !p.gaps.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn progress(&self, conversation: ConversationId) -> ConversationProgress {
        self.lock().get(&conversation).cloned().unwrap_or_default()
    }

    /// Copy of the full structured state.
    pub fn snapshot(&self) -> Vec<(ConversationId, ConversationProgress)> {
        self.lock()
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect()
    }

    fn mutate(&self, apply: impl FnOnce(&mut Conversations)) -> StorageResult<()> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        apply(&mut next);
        next.retain(|_, p| !p.is_blank());
        write_atomically(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

fn load(path: &Path) -> Conversations {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found, using empty progress state", path.display());
            return Conversations::new();
        }
        Err(e) => {
            warn!("could not read {}: {e}; using empty progress state", path.display());
            return Conversations::new();
        }
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(doc) => snapshot::decode(&doc),
        Err(e) => {
            warn!("could not parse {}: {e}; using empty progress state", path.display());
            Conversations::new()
        }
    }
}

fn write_atomically(path: &Path, state: &Conversations) -> StorageResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let doc = snapshot::encode(state);
    let mut tmp = tempfile::Builder::new()
        .prefix(".progress-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), &doc)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Persist {
        path: path.display().to_string(),
        reason: e.error.to_string(),
    })?;
    debug!("saved progress snapshot to {}", path.display());
    Ok(())
}
