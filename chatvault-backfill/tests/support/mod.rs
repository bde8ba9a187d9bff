//! Shared doubles for the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chatvault_backfill::{
    ActivityTracker, ArchiveReader, BackfillConfig, BackfillError, BackfillResult,
    BackfillScheduler, ConversationDirectory, ConversationLocks, HistorySource, PacingConfig,
    RecoverySink,
};
use chatvault_storage::ProgressStore;
use chatvault_types::{ConversationId, HistoryMessage, MessageId, RecoveredMessage, RecoveryKind};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const CHAT: ConversationId = ConversationId(42);
pub const CHANNEL: ConversationId = ConversationId(-1001);

// ── Messages ────────────────────────────────────────────────────

pub fn msg(id: MessageId) -> HistoryMessage {
    HistoryMessage::new(id, Utc::now())
}

pub fn aged_msg(id: MessageId, days: i64) -> HistoryMessage {
    HistoryMessage::new(id, Utc::now() - ChronoDuration::days(days))
}

pub fn msgs(ids: impl IntoIterator<Item = MessageId>) -> Vec<HistoryMessage> {
    ids.into_iter().map(msg).collect()
}

// ── Mock Source ─────────────────────────────────────────────────

/// In-memory history with an optional queue of canned responses.
///
/// Canned responses are consumed first, in order, by `fetch_messages`; once
/// the queue is empty the stored history answers.
#[derive(Default)]
pub struct FakeSource {
    history: Mutex<BTreeMap<ConversationId, Vec<HistoryMessage>>>,
    scripted: Mutex<VecDeque<BackfillResult<Vec<HistoryMessage>>>>,
    failing_earliest: Mutex<HashSet<ConversationId>>,
    /// `(conversation, limit, before_id)` of every `fetch_messages` call.
    calls: Mutex<Vec<(ConversationId, usize, MessageId)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(conversation: ConversationId, messages: Vec<HistoryMessage>) -> Self {
        let source = Self::new();
        source.set_history(conversation, messages);
        source
    }

    pub fn set_history(&self, conversation: ConversationId, messages: Vec<HistoryMessage>) {
        self.history.lock().unwrap().insert(conversation, messages);
    }

    pub fn push_response(&self, response: BackfillResult<Vec<HistoryMessage>>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn push_rate_limit(&self, wait_secs: u64) {
        self.push_response(Err(BackfillError::RateLimited { wait_secs }));
    }

    pub fn fail_earliest(&self, conversation: ConversationId) {
        self.failing_earliest.lock().unwrap().insert(conversation);
    }

    pub fn calls(&self) -> Vec<(ConversationId, usize, MessageId)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn before_ids(&self) -> Vec<MessageId> {
        self.calls().into_iter().map(|(_, _, before)| before).collect()
    }
}

#[async_trait]
impl HistorySource for FakeSource {
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
        before_id: MessageId,
    ) -> BackfillResult<Vec<HistoryMessage>> {
        self.calls
            .lock()
            .unwrap()
            .push((conversation, limit, before_id));
        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }
        let history = self.history.lock().unwrap();
        let mut batch: Vec<_> = history
            .get(&conversation)
            .map(|all| all.iter().filter(|m| m.id < before_id).cloned().collect())
            .unwrap_or_default();
        batch.sort_by(|a, b| b.id.cmp(&a.id));
        batch.truncate(limit);
        Ok(batch)
    }

    async fn fetch_earliest(&self, conversation: ConversationId) -> BackfillResult<Option<MessageId>> {
        if self.failing_earliest.lock().unwrap().contains(&conversation) {
            return Err(BackfillError::Source("connection reset".to_string()));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&conversation)
            .and_then(|all| all.iter().map(|m| m.id).min()))
    }
}

// ── Recording Sink ──────────────────────────────────────────────

/// Captures records; optionally raises a stop signal after N records.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<RecoveredMessage>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_after(count: usize, cancel: CancellationToken) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            cancel_after: Some((count, cancel)),
        }
    }

    pub fn records(&self) -> Vec<RecoveredMessage> {
        self.records.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.records().iter().map(|r| r.message.id).collect()
    }

    pub fn ids_of(&self, kind: RecoveryKind) -> Vec<MessageId> {
        self.records()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.message.id)
            .collect()
    }
}

#[async_trait]
impl RecoverySink for RecordingSink {
    async fn on_recovered(&self, record: RecoveredMessage) {
        let count = {
            let mut records = self.records.lock().unwrap();
            records.push(record);
            records.len()
        };
        if let Some((limit, cancel)) = &self.cancel_after {
            if count >= *limit {
                cancel.cancel();
            }
        }
    }
}

// ── In-memory Archive ───────────────────────────────────────────

#[derive(Default)]
pub struct MemoryArchive {
    ids: Mutex<BTreeMap<ConversationId, Vec<MessageId>>>,
    failing: Mutex<HashSet<ConversationId>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(conversation: ConversationId, ids: &[MessageId]) -> Self {
        let archive = Self::new();
        archive.set_ids(conversation, ids);
        archive
    }

    pub fn set_ids(&self, conversation: ConversationId, ids: &[MessageId]) {
        self.ids.lock().unwrap().insert(conversation, ids.to_vec());
    }

    pub fn fail(&self, conversation: ConversationId) {
        self.failing.lock().unwrap().insert(conversation);
    }
}

#[async_trait]
impl ArchiveReader for MemoryArchive {
    async fn list_archived_ids(&self, conversation: ConversationId) -> BackfillResult<Vec<MessageId>> {
        if self.failing.lock().unwrap().contains(&conversation) {
            return Err(BackfillError::Archive("relation does not exist".to_string()));
        }
        Ok(self
            .ids
            .lock()
            .unwrap()
            .get(&conversation)
            .cloned()
            .unwrap_or_default())
    }
}

// ── Harness ─────────────────────────────────────────────────────

/// Zero pacing and 1 s rate-limit padding; everything else default.
pub fn test_config() -> BackfillConfig {
    BackfillConfig {
        idle_interval_secs: 10,
        rate_limit_padding_secs: 1,
        pacing: PacingConfig::immediate(),
        ..BackfillConfig::default()
    }
}

/// Routes engine logs to the test harness output; `RUST_LOG` filters them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<ProgressStore>,
    pub source: Arc<FakeSource>,
    pub sink: Arc<RecordingSink>,
    pub activity: Arc<ActivityTracker>,
    pub locks: Arc<ConversationLocks>,
}

impl Harness {
    pub fn new(source: FakeSource) -> Self {
        Self::with_sink(source, RecordingSink::new())
    }

    pub fn with_sink(source: FakeSource, sink: RecordingSink) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProgressStore::open(dir.path().join("state.json")));
        Self {
            dir,
            store,
            source: Arc::new(source),
            sink: Arc::new(sink),
            activity: Arc::new(ActivityTracker::new()),
            locks: Arc::new(ConversationLocks::new()),
        }
    }

    pub fn scheduler(&self, config: BackfillConfig) -> BackfillScheduler {
        self.scheduler_with(config, ConversationDirectory::default())
    }

    pub fn scheduler_with(
        &self,
        config: BackfillConfig,
        directory: ConversationDirectory,
    ) -> BackfillScheduler {
        BackfillScheduler::new(
            config,
            self.store.clone(),
            self.source.clone(),
            self.sink.clone(),
            self.activity.clone(),
            self.locks.clone(),
            directory,
        )
        .unwrap()
    }

    /// Reopens the snapshot from disk, as a restarted process would.
    pub fn reopened_store(&self) -> ProgressStore {
        ProgressStore::open(self.store.path())
    }
}
