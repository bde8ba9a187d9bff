//! Rolling window of live-message arrivals.
//!
//! Live handlers call [`ActivityTracker::record_activity`]; the scheduler calls
//! [`ActivityTracker::consume_count_in_window`] once per cycle to decide
//! whether backfill should yield to live traffic.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Process-local record of recent live activity.
///
/// Shared by reference between producers and the scheduler; the internal lock
/// is only held for the push or prune itself.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    samples: Mutex<VecDeque<Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one live message event at the current instant.
    pub fn record_activity(&self) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back(Instant::now());
    }

    /// Counts samples no older than `window`, discarding everything older.
    pub fn consume_count_in_window(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        // Samples are pushed under the lock with a monotonic clock, so the
        // deque is ordered oldest-first.
        while let Some(oldest) = samples.front() {
            if now.saturating_duration_since(*oldest) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.len()
    }

    /// Samples currently retained, pruned or not.
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
