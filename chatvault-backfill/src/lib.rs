//! Backfill and gap reconciliation engine.
//!
//! Guarantees that the downstream archive eventually holds every message of
//! every tracked conversation without competing with live traffic for the
//! history source's rate budget.
//!
//! Two loops share a [`ProgressStore`](chatvault_storage::ProgressStore):
//!
//! - [`GapDetector`] periodically compares archived IDs with the source and
//!   records missing ranges plus a backfill cursor per conversation
//! - [`BackfillScheduler`] consumes that state, recovers messages in
//!   descending-ID batches, and hands each one to a [`RecoverySink`]
//!
//! [`spawn_engine`] wires both onto the tokio runtime.

pub mod activity;
pub mod archive;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod gap_detector;
pub mod http_source;
pub mod locks;
pub mod pacing;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use activity::ActivityTracker;
pub use archive::ArchiveReader;
pub use config::{BackfillConfig, DelayRange, PacingConfig};
pub use directory::ConversationDirectory;
pub use engine::{EngineHandle, EngineParts, spawn_engine};
pub use error::{BackfillError, BackfillResult};
pub use gap_detector::{GapDetector, GapReport, find_missing_ranges};
pub use http_source::HttpHistorySource;
pub use locks::ConversationLocks;
pub use pacing::PacingPolicy;
pub use scheduler::{BackfillScheduler, CycleOutcome};
pub use sink::{ArchivingSink, ChannelSink, RecoverySink};
pub use source::HistorySource;
