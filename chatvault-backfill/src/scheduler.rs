//! The backfill control loop.
//!
//! Each cycle sleeps the idle interval, yields to live traffic if the activity
//! tracker saw too many messages, and otherwise walks every conversation with
//! outstanding work:
//!
//! 1. **Gap fill**: each stored gap range, newest first, is walked backwards
//!    from `end + 1` in batches until the walk drops to `start`.
//! 2. **Cursor backfill**: one batch older than the cursor is recovered and the
//!    cursor moves down to the lowest recovered ID, or to 1 when the source has
//!    nothing older.
//!
//! Every recovered message is paced, handed to the [`RecoverySink`] and only
//! then counted as progress. Progress is persisted through the
//! [`ProgressStore`]; a cursor only ever moves down here.

use crate::activity::ActivityTracker;
use crate::config::BackfillConfig;
use crate::directory::ConversationDirectory;
use crate::error::{BackfillError, BackfillResult};
use crate::locks::{ConversationLocks, sleep_or_cancel};
use crate::pacing::PacingPolicy;
use crate::sink::RecoverySink;
use crate::source::HistorySource;
use chatvault_storage::ProgressStore;
use chatvault_types::{
    ConversationId, ConversationKind, GapRange, HistoryMessage, MessageId, RecoveredMessage,
    RecoveryKind,
};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single scheduler cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Live traffic exceeded the threshold; the source was not touched.
    Throttled,
    /// No conversation had a cursor above 1 or a stored gap.
    NoWork,
    /// Candidates were processed.
    Completed {
        conversations: usize,
        recovered: usize,
    },
    /// The stop signal was raised during the cycle.
    Stopped,
}

/// Conversation being worked on, with what the sink needs to label records.
struct Unit {
    conversation: ConversationId,
    kind: ConversationKind,
    title: String,
    /// Messages dated before this are out of scope.
    horizon: Option<DateTime<Utc>>,
}

/// Result of walking one gap range.
struct RangeFill {
    remainder: Option<GapRange>,
    recovered: usize,
    stopped: bool,
}

impl RangeFill {
    fn closed(recovered: usize) -> Self {
        Self {
            remainder: None,
            recovered,
            stopped: false,
        }
    }

    fn kept(range: GapRange, end: MessageId, recovered: usize) -> Self {
        Self {
            remainder: range.truncated_to(end),
            recovered,
            stopped: false,
        }
    }

    fn stopped(mut self) -> Self {
        self.stopped = true;
        self
    }
}

pub struct BackfillScheduler {
    config: BackfillConfig,
    store: Arc<ProgressStore>,
    source: Arc<dyn HistorySource>,
    sink: Arc<dyn RecoverySink>,
    activity: Arc<ActivityTracker>,
    locks: Arc<ConversationLocks>,
    directory: ConversationDirectory,
    pacing: PacingPolicy,
    /// Highest message ID seen beyond the age cutoff, per conversation.
    parked: Mutex<HashMap<ConversationId, MessageId>>,
    /// Cursor value at which the cursor pass hit the age cutoff.
    parked_cursors: Mutex<HashMap<ConversationId, MessageId>>,
}

impl BackfillScheduler {
    pub fn new(
        config: BackfillConfig,
        store: Arc<ProgressStore>,
        source: Arc<dyn HistorySource>,
        sink: Arc<dyn RecoverySink>,
        activity: Arc<ActivityTracker>,
        locks: Arc<ConversationLocks>,
        directory: ConversationDirectory,
    ) -> BackfillResult<Self> {
        config.validate()?;
        let pacing = PacingPolicy::new(config.pacing.clone())?;
        Ok(Self {
            config,
            store,
            source,
            sink,
            activity,
            locks,
            directory,
            pacing,
            parked: Mutex::new(HashMap::new()),
            parked_cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Runs cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "backfill scheduler started (idle {}s, batch {}, threshold {})",
            self.config.idle_interval_secs, self.config.batch_size, self.config.activity_threshold
        );
        loop {
            match self.run_cycle(&cancel).await {
                CycleOutcome::Stopped => break,
                CycleOutcome::Throttled => debug!("live traffic detected, backfill deferred"),
                CycleOutcome::NoWork => debug!("no conversations need backfill"),
                CycleOutcome::Completed {
                    conversations,
                    recovered,
                } => {
                    if recovered > 0 {
                        info!("backfill cycle recovered {recovered} messages across {conversations} conversations");
                    }
                }
            }
        }
        info!("backfill scheduler stopped");
    }

    /// One idle wait, throttle check and pass over all candidates.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        if sleep_or_cancel(self.config.idle_interval(), cancel).await.is_err() {
            return CycleOutcome::Stopped;
        }

        let live = self
            .activity
            .consume_count_in_window(self.config.idle_interval());
        if live > self.config.activity_threshold {
            return CycleOutcome::Throttled;
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return CycleOutcome::NoWork;
        }

        let mut conversations = 0;
        let mut recovered = 0;
        for conversation in candidates {
            if cancel.is_cancelled() {
                return CycleOutcome::Stopped;
            }
            match self.process_conversation(conversation, cancel).await {
                Ok(n) => {
                    conversations += 1;
                    recovered += n;
                }
                Err(e) if e.is_cancelled() => return CycleOutcome::Stopped,
                Err(e) => warn!("backfill of {conversation} skipped this cycle: {e}"),
            }
        }
        CycleOutcome::Completed {
            conversations,
            recovered,
        }
    }

    /// Conversations with work, deepest-remaining cursor first.
    pub fn candidates(&self) -> Vec<ConversationId> {
        let mut ids = self.store.conversations_needing_work();
        ids.sort_by_key(|&id| {
            Reverse(
                self.store
                    .cursor(id)
                    .filter(|&c| c > 1)
                    .unwrap_or(MessageId::MIN),
            )
        });
        ids
    }

    /// Highest ID found beyond the age cutoff for `conversation`, if any.
    pub fn horizon_floor(&self, conversation: ConversationId) -> Option<MessageId> {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation)
            .copied()
    }

    fn park(&self, conversation: ConversationId, id: MessageId) {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        let floor = parked.entry(conversation).or_insert(id);
        *floor = (*floor).max(id);
    }

    fn park_cursor(&self, conversation: ConversationId, cursor: MessageId) {
        self.parked_cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation, cursor);
    }

    /// Whether the cursor pass already stopped at the age cutoff from `cursor`.
    ///
    /// Any other cursor value, e.g. one set by the operator or reseeded by the
    /// gap detector, is fetched from again.
    fn cursor_parked(&self, conversation: ConversationId, cursor: MessageId) -> bool {
        let paused_at = self
            .parked_cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation)
            .copied();
        paused_at == Some(cursor)
            || self
                .horizon_floor(conversation)
                .is_some_and(|floor| cursor <= floor.saturating_add(1))
    }

    async fn process_conversation(
        &self,
        conversation: ConversationId,
        cancel: &CancellationToken,
    ) -> BackfillResult<usize> {
        let _guard = self.locks.acquire(conversation, cancel).await?;
        let unit = Unit {
            conversation,
            kind: self.directory.kind(conversation),
            title: self.directory.title(conversation),
            horizon: self.config.max_age().map(|age| Utc::now() - age),
        };
        let filled = self.fill_gaps(&unit, cancel).await?;
        let backfilled = self.backfill_cursor(&unit, cancel).await?;
        Ok(filled + backfilled)
    }

    async fn fill_gaps(&self, unit: &Unit, cancel: &CancellationToken) -> BackfillResult<usize> {
        let conversation = unit.conversation;
        let mut ranges = self.store.gap_ranges(conversation);
        if ranges.is_empty() {
            return Ok(0);
        }
        ranges.sort_by_key(|r| Reverse(r.end()));
        debug!("{conversation}: {} gap ranges to fill", ranges.len());

        let mut kept = Vec::with_capacity(ranges.len());
        let mut recovered = 0;
        let mut stopped = false;
        for range in &ranges {
            if stopped || cancel.is_cancelled() {
                stopped = true;
                kept.push(*range);
                continue;
            }
            if self.horizon_floor(conversation).is_some_and(|floor| range.end() <= floor) {
                kept.push(*range);
                continue;
            }
            let fill = self.fill_range(unit, *range, cancel).await;
            recovered += fill.recovered;
            stopped = fill.stopped;
            match fill.remainder {
                Some(rest) => {
                    debug!("{conversation}: gap {range} left as {rest}");
                    kept.push(rest);
                }
                None => debug!("{conversation}: gap {range} closed"),
            }
        }

        if kept != ranges {
            if kept.is_empty() {
                info!("{conversation}: all gaps filled");
            } else {
                info!("{conversation}: {} gap ranges remaining", kept.len());
            }
            if let Err(e) = self.store.set_gap_ranges(conversation, kept) {
                error!("{conversation}: failed to save gap ranges: {e}");
            }
        }
        if stopped {
            Err(BackfillError::Cancelled)
        } else {
            Ok(recovered)
        }
    }

    async fn fill_range(&self, unit: &Unit, range: GapRange, cancel: &CancellationToken) -> RangeFill {
        let conversation = unit.conversation;
        let start = range.start();
        let mut offset = range.end() + 1;
        let mut recovered = 0;
        debug!("{conversation}: filling gap {range}");

        while offset > start {
            let batch = match self.fetch_batch(conversation, offset, cancel).await {
                Ok(batch) => batch,
                Err(e) if e.is_cancelled() => {
                    return RangeFill::kept(range, offset - 1, recovered).stopped();
                }
                Err(e) => {
                    warn!("{conversation}: gap {range} deferred: {e}");
                    return RangeFill::kept(range, offset - 1, recovered);
                }
            };
            if batch.is_empty() {
                debug!("{conversation}: source has nothing below {offset}");
                return RangeFill::kept(range, offset - 1, recovered);
            }

            let mut lowest = offset;
            for message in batch {
                if message.id < start {
                    lowest = start;
                    break;
                }
                if is_beyond(&message, unit.horizon) {
                    info!(
                        "{conversation}: message {} is past the age cutoff, pausing gap {range}",
                        message.id
                    );
                    self.park(conversation, message.id);
                    return RangeFill::kept(range, message.id, recovered);
                }
                if sleep_or_cancel(self.pacing.delay(unit.kind), cancel).await.is_err() {
                    return RangeFill::kept(range, message.id, recovered).stopped();
                }
                lowest = message.id;
                self.emit(unit, RecoveryKind::GapFill, message).await;
                recovered += 1;
            }

            if lowest >= offset {
                return RangeFill::kept(range, offset - 1, recovered);
            }
            offset = lowest;
        }
        RangeFill::closed(recovered)
    }

    async fn backfill_cursor(&self, unit: &Unit, cancel: &CancellationToken) -> BackfillResult<usize> {
        let conversation = unit.conversation;
        let Some(cursor) = self.store.cursor(conversation).filter(|&c| c > 1) else {
            return Ok(0);
        };
        if self.cursor_parked(conversation, cursor) {
            debug!("{conversation}: parked at the age cutoff, cursor stays at {cursor}");
            return Ok(0);
        }

        debug!("{conversation}: backfilling below {cursor}");
        let batch = self.fetch_batch(conversation, cursor, cancel).await?;
        if batch.is_empty() {
            info!("{conversation}: no older messages, history fully backfilled");
            if let Err(e) = self.store.set_cursor(conversation, 1) {
                error!("{conversation}: failed to save cursor: {e}");
            }
            return Ok(0);
        }

        let mut lowest = cursor;
        let mut recovered = 0;
        let mut stopped = false;
        let mut beyond = None;
        for message in batch {
            if is_beyond(&message, unit.horizon) {
                info!(
                    "{conversation}: message {} is past the age cutoff, backfill paused",
                    message.id
                );
                beyond = Some(message.id);
                break;
            }
            if sleep_or_cancel(self.pacing.delay(unit.kind), cancel).await.is_err() {
                stopped = true;
                break;
            }
            lowest = message.id;
            self.emit(unit, RecoveryKind::Backfill, message).await;
            recovered += 1;
        }

        if lowest < cursor {
            match self.store.set_cursor(conversation, lowest) {
                Ok(()) => info!("{conversation}: backfill cursor moved to {lowest}"),
                Err(e) => error!("{conversation}: failed to save cursor: {e}"),
            }
        }
        if let Some(id) = beyond {
            self.park(conversation, id);
            self.park_cursor(conversation, lowest);
        }
        if stopped {
            Err(BackfillError::Cancelled)
        } else {
            Ok(recovered)
        }
    }

    /// Fetches the batch below `before_id`, newest first and de-duplicated,
    /// retrying rate-limit signals up to the configured budget.
    async fn fetch_batch(
        &self,
        conversation: ConversationId,
        before_id: MessageId,
        cancel: &CancellationToken,
    ) -> BackfillResult<Vec<HistoryMessage>> {
        let mut retries = 0;
        loop {
            let fetched = tokio::select! {
                res = self.source.fetch_messages(conversation, self.config.batch_size, before_id) => res,
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
            };
            match fetched {
                Ok(mut batch) => {
                    batch.retain(|m| m.id < before_id);
                    batch.sort_unstable_by_key(|m| Reverse(m.id));
                    batch.dedup_by_key(|m| m.id);
                    debug!(
                        "{conversation}: fetched {} messages below {before_id}",
                        batch.len()
                    );
                    return Ok(batch);
                }
                Err(e) if e.is_rate_limited() && retries < self.config.max_rate_limit_retries => {
                    retries += 1;
                    let wait = self.config.backoff_for(e.retry_after().unwrap_or_default());
                    warn!(
                        "{conversation}: rate limited, sleeping {}s (retry {retries}/{})",
                        wait.as_secs(),
                        self.config.max_rate_limit_retries
                    );
                    sleep_or_cancel(wait, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn emit(&self, unit: &Unit, kind: RecoveryKind, message: HistoryMessage) {
        let record = RecoveredMessage {
            kind,
            conversation: unit.conversation,
            conversation_title: unit.title.clone(),
            message,
            recovered_at: Utc::now(),
        };
        self.sink.on_recovered(record).await;
    }
}

fn is_beyond(message: &HistoryMessage, horizon: Option<DateTime<Utc>>) -> bool {
    horizon.is_some_and(|h| message.date < h)
}
