//! Spawning and stopping the two engine loops.

use crate::activity::ActivityTracker;
use crate::archive::ArchiveReader;
use crate::config::BackfillConfig;
use crate::directory::ConversationDirectory;
use crate::error::{BackfillError, BackfillResult};
use crate::gap_detector::GapDetector;
use crate::locks::ConversationLocks;
use crate::scheduler::BackfillScheduler;
use crate::sink::RecoverySink;
use crate::source::HistorySource;
use chatvault_storage::ProgressStore;
use chatvault_types::{ConversationId, MessageId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Collaborators the engine is wired to.
pub struct EngineParts {
    pub store: Arc<ProgressStore>,
    pub source: Arc<dyn HistorySource>,
    pub archive: Arc<dyn ArchiveReader>,
    pub sink: Arc<dyn RecoverySink>,
    pub directory: ConversationDirectory,
}

/// Running engine. Dropping it does not stop the loops; call [`shutdown`](Self::shutdown).
pub struct EngineHandle {
    cancel: CancellationToken,
    activity: Arc<ActivityTracker>,
    store: Arc<ProgressStore>,
    locks: Arc<ConversationLocks>,
    scheduler: JoinHandle<()>,
    detector: JoinHandle<()>,
}

impl EngineHandle {
    /// Tracker that live-message handlers report to.
    pub fn activity(&self) -> Arc<ActivityTracker> {
        self.activity.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Operator override of a conversation's backfill cursor.
    ///
    /// Waits for any pass over the conversation to finish. Setting 1 marks its
    /// history as fully backfilled.
    pub async fn set_backfill(
        &self,
        conversation: ConversationId,
        offset: MessageId,
    ) -> BackfillResult<()> {
        if offset < 1 {
            return Err(BackfillError::Config(format!(
                "backfill offset for {conversation} must be at least 1, got {offset}"
            )));
        }
        let _guard = self.locks.acquire(conversation, &self.cancel).await?;
        self.store.set_cursor(conversation, offset)?;
        info!("{conversation}: backfill cursor set to {offset} by operator");
        Ok(())
    }

    /// Raises the stop signal and waits for both loops to finish.
    pub async fn shutdown(self) -> BackfillResult<()> {
        self.cancel.cancel();
        let (scheduler, detector) = tokio::join!(self.scheduler, self.detector);
        scheduler.map_err(|e| BackfillError::Task(format!("scheduler: {e}")))?;
        detector.map_err(|e| BackfillError::Task(format!("gap detector: {e}")))?;
        info!("backfill engine stopped");
        Ok(())
    }
}

/// Starts the scheduler and the gap detector on the current runtime.
pub fn spawn_engine(parts: EngineParts, config: BackfillConfig) -> BackfillResult<EngineHandle> {
    let cancel = CancellationToken::new();
    let activity = Arc::new(ActivityTracker::new());
    let locks = Arc::new(ConversationLocks::new());
    let scan_interval = config.gap_scan_interval();

    let scheduler = BackfillScheduler::new(
        config,
        parts.store.clone(),
        parts.source.clone(),
        parts.sink,
        activity.clone(),
        locks.clone(),
        parts.directory.clone(),
    )?;
    let detector = GapDetector::new(
        parts.store.clone(),
        parts.source,
        parts.archive,
        locks.clone(),
    );
    let directory = parts.directory;

    info!("starting backfill engine for {} conversations", directory.len());
    let scheduler = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });
    let detector = tokio::spawn({
        let cancel = cancel.clone();
        async move { detector.run(&directory, scan_interval, cancel).await }
    });

    Ok(EngineHandle {
        cancel,
        activity,
        store: parts.store,
        locks,
        scheduler,
        detector,
    })
}
