//! Reconciliation of the archive against the source's retrievable history.
//!
//! For each conversation the detector compares the archived message IDs with
//! the oldest ID the source still serves, then:
//! - seeds the backfill cursor when the archive is empty or is missing a prefix,
//! - replaces the conversation's gap list with the holes between archived IDs.
//!
//! It never fetches message bodies; the scheduler does the actual recovery.

use crate::archive::ArchiveReader;
use crate::directory::ConversationDirectory;
use crate::error::BackfillResult;
use crate::locks::{ConversationLocks, sleep_or_cancel};
use crate::source::HistorySource;
use chatvault_storage::ProgressStore;
use chatvault_types::{ConversationId, GapRange, MessageId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Holes between consecutive IDs of an ascending, de-duplicated sequence.
pub fn find_missing_ranges(sorted_ids: &[MessageId]) -> Vec<GapRange> {
    sorted_ids
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            if next > prev.saturating_add(1) {
                GapRange::new(prev + 1, next - 1)
            } else {
                None
            }
        })
        .collect()
}

/// Outcome of reconciling one conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GapReport {
    pub conversation: ConversationId,
    pub earliest_archived: Option<MessageId>,
    pub earliest_in_source: Option<MessageId>,
    /// Cursor stored after reconciliation.
    pub cursor: Option<MessageId>,
    pub ranges: Vec<GapRange>,
    pub total_missing: u64,
}

/// Cursor the detector should store, or `None` to leave the stored one alone.
///
/// A stored cursor strictly between 1 and the proposal means a backfill has
/// already walked further down than the archive shows, so it wins.
fn seeded_cursor(stored: Option<MessageId>, proposed: MessageId) -> Option<MessageId> {
    match stored {
        Some(current) if current > 1 && current < proposed => None,
        Some(current) if current == proposed => None,
        _ => Some(proposed),
    }
}

/// Periodic gap reconciliation pass.
pub struct GapDetector {
    store: Arc<ProgressStore>,
    source: Arc<dyn HistorySource>,
    archive: Arc<dyn ArchiveReader>,
    locks: Arc<ConversationLocks>,
}

impl GapDetector {
    pub fn new(
        store: Arc<ProgressStore>,
        source: Arc<dyn HistorySource>,
        archive: Arc<dyn ArchiveReader>,
        locks: Arc<ConversationLocks>,
    ) -> Self {
        Self {
            store,
            source,
            archive,
            locks,
        }
    }

    /// Reconciles one conversation while holding its lock.
    pub async fn reconcile(
        &self,
        conversation: ConversationId,
        cancel: &CancellationToken,
    ) -> BackfillResult<GapReport> {
        let _guard = self.locks.acquire(conversation, cancel).await?;

        let mut archived = self.archive.list_archived_ids(conversation).await?;
        archived.sort_unstable();
        archived.dedup();
        let earliest_in_source = self.source.fetch_earliest(conversation).await?;
        let earliest_archived = archived.first().copied();
        debug!(
            "{conversation}: earliest archived {earliest_archived:?}, earliest in source {earliest_in_source:?}"
        );

        let stored = self.store.cursor(conversation);
        let proposed = match (earliest_archived, earliest_in_source) {
            (None, source) => source,
            (Some(archived), Some(source)) if archived > source.saturating_add(1) => Some(archived),
            _ => None,
        };
        let mut progress = self.store.progress(conversation);
        if let Some(cursor) = proposed.and_then(|p| seeded_cursor(stored, p)) {
            info!("{conversation}: backfill cursor seeded at {cursor}");
            progress.cursor = Some(cursor);
        }
        progress.gaps = find_missing_ranges(&archived);
        let total_missing = progress.gaps.iter().map(GapRange::len).sum();
        self.store.set_progress(conversation, progress.clone())?;

        if total_missing > 0 {
            info!(
                "{conversation}: {} gap ranges, {total_missing} missing messages",
                progress.gaps.len()
            );
        }
        Ok(GapReport {
            conversation,
            earliest_archived,
            earliest_in_source,
            cursor: progress.cursor,
            ranges: progress.gaps,
            total_missing,
        })
    }

    /// Reconciles every conversation in turn.
    ///
    /// Failures are logged and skipped; cancellation ends the pass early.
    pub async fn reconcile_all(
        &self,
        conversations: &[ConversationId],
        cancel: &CancellationToken,
    ) -> Vec<GapReport> {
        let mut reports = Vec::with_capacity(conversations.len());
        for &conversation in conversations {
            if cancel.is_cancelled() {
                break;
            }
            match self.reconcile(conversation, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!("gap check for {conversation} skipped: {e}"),
            }
        }
        reports
    }

    /// Runs a reconciliation pass over `directory` every `interval` until cancelled.
    pub async fn run(
        &self,
        directory: &ConversationDirectory,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let conversations: Vec<_> = directory.ids().collect();
        info!(
            "gap detector started for {} conversations, every {}s",
            conversations.len(),
            interval.as_secs()
        );
        loop {
            let reports = self.reconcile_all(&conversations, &cancel).await;
            let missing: u64 = reports.iter().map(|r| r.total_missing).sum();
            info!(
                "gap check finished: {} conversations reconciled, {missing} messages missing",
                reports.len()
            );
            if sleep_or_cancel(interval, &cancel).await.is_err() {
                break;
            }
        }
        info!("gap detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(pairs: &[(i64, i64)]) -> Vec<GapRange> {
        pairs
            .iter()
            .map(|&(s, e)| GapRange::new(s, e).unwrap())
            .collect()
    }

    #[test]
    fn finds_holes_between_archived_ids() {
        assert_eq!(find_missing_ranges(&[5, 6, 9, 10]), ranges(&[(7, 8)]));
        assert_eq!(
            find_missing_ranges(&[1, 3, 4, 10]),
            ranges(&[(2, 2), (5, 9)])
        );
    }

    #[test]
    fn contiguous_or_short_sequences_have_no_holes() {
        assert!(find_missing_ranges(&[]).is_empty());
        assert!(find_missing_ranges(&[42]).is_empty());
        assert!(find_missing_ranges(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn cursor_seeding_keeps_deeper_backfill() {
        assert_eq!(seeded_cursor(None, 100), Some(100));
        assert_eq!(seeded_cursor(Some(1), 100), Some(100));
        assert_eq!(seeded_cursor(Some(40), 100), None);
        assert_eq!(seeded_cursor(Some(100), 100), None);
        assert_eq!(seeded_cursor(Some(250), 100), Some(100));
    }

    proptest! {
        #[test]
        fn ranges_cover_exactly_the_missing_ids(
            mut ids in proptest::collection::vec(1i64..500, 0..60)
        ) {
            ids.sort_unstable();
            ids.dedup();
            let found = find_missing_ranges(&ids);

            for pair in found.windows(2) {
                prop_assert!(pair[0].end() + 1 < pair[1].start());
            }
            if let (Some(&first), Some(&last)) = (ids.first(), ids.last()) {
                for id in first..=last {
                    let archived = ids.binary_search(&id).is_ok();
                    let in_gap = found.iter().any(|r| r.contains(id));
                    prop_assert_ne!(archived, in_gap);
                }
            }
            let missing: u64 = found.iter().map(GapRange::len).sum();
            let span = ids.last().zip(ids.first()).map_or(0, |(l, f)| (l - f + 1) as u64);
            prop_assert_eq!(missing + ids.len() as u64, span.max(ids.len() as u64));
        }
    }
}
