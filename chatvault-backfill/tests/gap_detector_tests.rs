mod support;

use chatvault_backfill::{ConversationDirectory, GapDetector, GapReport};
use chatvault_storage::ProgressStore;
use chatvault_types::{ConversationId, ConversationInfo, ConversationKind, GapRange};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    store: Arc<ProgressStore>,
    source: Arc<FakeSource>,
    archive: Arc<MemoryArchive>,
    locks: Arc<chatvault_backfill::ConversationLocks>,
}

impl Fixture {
    fn new(source: FakeSource, archive: MemoryArchive) -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            store: Arc::new(ProgressStore::open(dir.path().join("state.json"))),
            _dir: dir,
            source: Arc::new(source),
            archive: Arc::new(archive),
            locks: Arc::new(chatvault_backfill::ConversationLocks::new()),
        }
    }

    fn detector(&self) -> GapDetector {
        GapDetector::new(
            self.store.clone(),
            self.source.clone(),
            self.archive.clone(),
            self.locks.clone(),
        )
    }
}

fn range(start: i64, end: i64) -> GapRange {
    GapRange::new(start, end).unwrap()
}

#[tokio::test]
async fn holes_between_archived_ids_become_ranges() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(5..=10)),
        MemoryArchive::with_ids(CHAT, &[5, 6, 9, 10]),
    );

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report,
        GapReport {
            conversation: CHAT,
            earliest_archived: Some(5),
            earliest_in_source: Some(5),
            cursor: None,
            ranges: vec![range(7, 8)],
            total_missing: 2,
        }
    );
    assert_eq!(fx.store.gap_ranges(CHAT), vec![range(7, 8)]);
    assert_eq!(fx.store.cursor(CHAT), None);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=100)),
        MemoryArchive::with_ids(CHAT, &[40, 41, 45, 60, 61, 62, 90]),
    );
    let detector = fx.detector();
    let cancel = CancellationToken::new();

    let first = detector.reconcile(CHAT, &cancel).await.unwrap();
    let snapshot = fx.store.snapshot();
    let second = detector.reconcile(CHAT, &cancel).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fx.store.snapshot(), snapshot);
    assert_eq!(
        second.ranges,
        vec![range(42, 44), range(46, 59), range(63, 89)]
    );
    assert_eq!(second.cursor, Some(40));
}

#[tokio::test]
async fn unsorted_archive_listing_is_normalized() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=10)),
        MemoryArchive::with_ids(CHAT, &[10, 1, 4, 4, 2]),
    );

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.earliest_archived, Some(1));
    assert_eq!(report.ranges, vec![range(3, 3), range(5, 9)]);
    assert_eq!(report.total_missing, 6);
}

#[tokio::test]
async fn empty_archive_seeds_cursor_and_clears_ranges() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(3..=30)),
        MemoryArchive::new(),
    );
    fx.store.set_gap_ranges(CHAT, vec![range(7, 8)]).unwrap();

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cursor, Some(3));
    assert_eq!(fx.store.cursor(CHAT), Some(3));
    assert!(fx.store.gap_ranges(CHAT).is_empty());
}

#[tokio::test]
async fn empty_archive_and_source_leave_no_state() {
    let fx = Fixture::new(FakeSource::new(), MemoryArchive::new());

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cursor, None);
    assert!(fx.store.snapshot().is_empty());
}

#[tokio::test]
async fn missing_prefix_raises_cursor_to_earliest_archived() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=60)),
        MemoryArchive::with_ids(CHAT, &[50, 51]),
    );

    fx.detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fx.store.cursor(CHAT), Some(50));
}

#[tokio::test]
async fn finished_cursor_is_reopened_for_missing_prefix() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=60)),
        MemoryArchive::with_ids(CHAT, &[50, 51]),
    );
    fx.store.set_cursor(CHAT, 1).unwrap();

    fx.detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fx.store.cursor(CHAT), Some(50));
}

#[tokio::test]
async fn deeper_backfill_cursor_is_kept() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=60)),
        MemoryArchive::with_ids(CHAT, &[50, 51]),
    );
    fx.store.set_cursor(CHAT, 20).unwrap();

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cursor, Some(20));
    assert_eq!(fx.store.cursor(CHAT), Some(20));
}

#[tokio::test]
async fn adjacent_source_start_needs_no_backfill() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=5)),
        MemoryArchive::with_ids(CHAT, &[2, 3, 4, 5]),
    );

    let report = fx
        .detector()
        .reconcile(CHAT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cursor, None);
    assert!(report.ranges.is_empty());
}

#[tokio::test]
async fn failures_skip_only_the_affected_conversation() {
    let other = ConversationId(7);
    let third = ConversationId(8);
    let source = FakeSource::with_history(CHAT, msgs(1..=10));
    source.set_history(other, msgs(1..=10));
    source.set_history(third, msgs(1..=10));
    source.fail_earliest(third);
    let archive = MemoryArchive::with_ids(CHAT, &[1, 5]);
    archive.set_ids(other, &[1, 5]);
    archive.fail(other);
    let fx = Fixture::new(source, archive);
    fx.store.set_gap_ranges(other, vec![range(2, 3)]).unwrap();

    let reports = fx
        .detector()
        .reconcile_all(&[other, third, CHAT], &CancellationToken::new())
        .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].conversation, CHAT);
    assert_eq!(fx.store.gap_ranges(CHAT), vec![range(2, 4)]);
    assert_eq!(fx.store.gap_ranges(other), vec![range(2, 3)]);
    assert!(fx.store.gap_ranges(third).is_empty());
}

#[tokio::test]
async fn reconcile_waits_for_fill_lock() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=10)),
        MemoryArchive::with_ids(CHAT, &[1, 5]),
    );
    let detector = Arc::new(fx.detector());
    let cancel = CancellationToken::new();
    let guard = fx.locks.acquire(CHAT, &cancel).await.unwrap();

    let task = tokio::spawn({
        let detector = detector.clone();
        let cancel = cancel.clone();
        async move { detector.reconcile(CHAT, &cancel).await }
    });
    tokio::task::yield_now().await;
    assert!(fx.store.gap_ranges(CHAT).is_empty());

    drop(guard);
    task.await.unwrap().unwrap();
    assert_eq!(fx.store.gap_ranges(CHAT), vec![range(2, 4)]);
}

#[tokio::test]
async fn cancelled_reconcile_reports_cancellation() {
    let fx = Fixture::new(FakeSource::new(), MemoryArchive::new());
    let cancel = CancellationToken::new();
    let _guard = fx.locks.acquire(CHAT, &cancel).await.unwrap();
    cancel.cancel();

    let err = fx.detector().reconcile(CHAT, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn run_loop_rescans_on_interval_until_cancelled() {
    let fx = Fixture::new(
        FakeSource::with_history(CHAT, msgs(1..=10)),
        MemoryArchive::with_ids(CHAT, &[1, 5]),
    );
    let detector = Arc::new(fx.detector());
    let directory = ConversationDirectory::new([ConversationInfo::new(
        CHAT,
        ConversationKind::Chat,
        "ops",
    )]);
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let detector = detector.clone();
        let cancel = cancel.clone();
        async move {
            detector
                .run(&directory, Duration::from_secs(1800), cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fx.store.gap_ranges(CHAT), vec![range(2, 4)]);

    fx.archive.set_ids(CHAT, &[1, 2, 3, 4, 5]);
    tokio::time::sleep(Duration::from_secs(1800)).await;
    assert!(fx.store.gap_ranges(CHAT).is_empty());

    cancel.cancel();
    task.await.unwrap();
}
