//! Global atomic counters for rcforge observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    builds_cancelled: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            builds_started: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            builds_cancelled: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn inc_builds_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_started", "counter incremented");
    }

    pub fn inc_builds_succeeded(&self) {
        self.builds_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_succeeded", "counter incremented");
    }

    pub fn inc_builds_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_failed", "counter incremented");
    }

    pub fn inc_builds_cancelled(&self) {
        self.builds_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_cancelled", "counter incremented");
    }

    pub fn inc_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` events dropped for slow subscribers.
    pub fn add_events_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "events_dropped", n, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (shutdown, periodic daemon tick) rather
    /// than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds_started = self.builds_started(),
            builds_succeeded = self.builds_succeeded(),
            builds_failed = self.builds_failed(),
            builds_cancelled = self.builds_cancelled(),
            events_published = self.events_published(),
            events_dropped = self.events_dropped(),
        );
    }

    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::Relaxed)
    }

    pub fn builds_succeeded(&self) -> u64 {
        self.builds_succeeded.load(Ordering::Relaxed)
    }

    pub fn builds_failed(&self) -> u64 {
        self.builds_failed.load(Ordering::Relaxed)
    }

    pub fn builds_cancelled(&self) -> u64 {
        self.builds_cancelled.load(Ordering::Relaxed)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.builds_started.store(0, Ordering::Relaxed);
        self.builds_succeeded.store(0, Ordering::Relaxed);
        self.builds_failed.store(0, Ordering::Relaxed);
        self.builds_cancelled.store(0, Ordering::Relaxed);
        self.events_published.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
    }
}
