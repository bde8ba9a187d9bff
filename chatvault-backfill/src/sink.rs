//! Destinations for recovered messages.

use async_trait::async_trait;
use chatvault_storage::ArchiveIndex;
use chatvault_types::RecoveredMessage;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Receives every message the engine recovers.
///
/// The engine awaits each call before moving on, which makes the sink a
/// natural pacing point.
#[async_trait]
pub trait RecoverySink: Send + Sync {
    async fn on_recovered(&self, record: RecoveredMessage);
}

/// Hands records to an mpsc channel (the event-bus publisher's inbox).
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RecoveredMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RecoveredMessage>) -> Self {
        Self { tx }
    }

    /// Creates a sink together with the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RecoveredMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecoverySink for ChannelSink {
    async fn on_recovered(&self, record: RecoveredMessage) {
        let id = record.message.id;
        if let Err(e) = self.tx.send(record).await {
            error!("dropping recovered message {id}: receiver closed ({e})");
        }
    }
}

/// Marks each record as archived in the [`ArchiveIndex`], then forwards it.
pub struct ArchivingSink<S> {
    archive: ArchiveIndex,
    inner: S,
}

impl<S> ArchivingSink<S> {
    pub fn new(archive: ArchiveIndex, inner: S) -> Self {
        Self { archive, inner }
    }
}

#[async_trait]
impl<S: RecoverySink> RecoverySink for ArchivingSink<S> {
    async fn on_recovered(&self, record: RecoveredMessage) {
        let archive = self.archive.clone();
        let (conversation, id) = (record.conversation, record.message.id);
        match tokio::task::spawn_blocking(move || archive.record(conversation, id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to index message {id} of {conversation}: {e}"),
            Err(e) => warn!("archive indexing task panicked for message {id}: {e}"),
        }
        self.inner.on_recovered(record).await;
    }
}
