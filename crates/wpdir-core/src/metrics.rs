//! In-process counters for the update pipeline and the search engine.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    searches: AtomicU64,
    search_micros: AtomicU64,
    search_queue: AtomicU64,
    updates_ok: AtomicU64,
    updates_failed: AtomicU64,
    updates_unpublished: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub searches: u64,
    pub search_micros: u64,
    pub search_queue: u64,
    pub updates_ok: u64,
    pub updates_failed: u64,
    pub updates_unpublished: u64,
}

impl MetricsSnapshot {
    /// Mean duration of a completed search.
    pub fn mean_search_time(&self) -> Duration {
        if self.searches == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.search_micros / self.searches)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_search(&self, elapsed: Duration) {
        self.searches.fetch_add(1, Ordering::Relaxed);
        self.search_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_search_queue(&self, depth: usize) {
        self.search_queue.store(depth as u64, Ordering::Relaxed);
    }

    pub fn record_update_ok(&self) {
        self.updates_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_failed(&self) {
        self.updates_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unpublished(&self) {
        self.updates_unpublished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            searches: self.searches.load(Ordering::Relaxed),
            search_micros: self.search_micros.load(Ordering::Relaxed),
            search_queue: self.search_queue.load(Ordering::Relaxed),
            updates_ok: self.updates_ok.load(Ordering::Relaxed),
            updates_failed: self.updates_failed.load(Ordering::Relaxed),
            updates_unpublished: self.updates_unpublished.load(Ordering::Relaxed),
        }
    }
}
