use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

pub const SPANS_RECEIVED: &str = "spans.received";
pub const SPANS_DROPPED: &str = "spans.dropped";
pub const REPORTER_ERRORS: &str = "reporter.errors";
pub const QUEUE_SIZE: &str = "queue.size";
pub const QUEUE_REMAINING_CAPACITY: &str = "queue.remaining_capacity";

/// Counters for what happened to the spans handed to the reporter.
///
/// These are purely statistical, so every access is `Relaxed`.
#[derive(Debug, Default)]
pub struct SpanMetrics {
    received: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl SpanMetrics {
    pub fn report_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the dropped count including this drop.
    pub fn report_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn report_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A point-in-time copy of the reporter counters and queue gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanMetricsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub errors: u64,
    pub queue_size: u64,
    pub queue_remaining_capacity: u64,
}

impl SpanMetricsSnapshot {
    /// Name and value of every counter and gauge, in a stable order.
    pub fn named_values(&self) -> [(&'static str, f64); 5] {
        [
            (SPANS_RECEIVED, self.received as f64),
            (SPANS_DROPPED, self.dropped as f64),
            (REPORTER_ERRORS, self.errors as f64),
            (QUEUE_SIZE, self.queue_size as f64),
            (QUEUE_REMAINING_CAPACITY, self.queue_remaining_capacity as f64),
        ]
    }
}

/// Lets at most one warning through per interval so a full buffer cannot flood the log.
pub struct WarningLimiter {
    interval_millis: u64,
    epoch: Instant,
    // Millis since `epoch` at which the next warning may be logged.
    next_allowed: AtomicU64,
    suppressed: AtomicU64,
}

impl WarningLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_millis: interval.as_millis() as u64,
            epoch: Instant::now(),
            next_allowed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed since the last allowed warning)` when a warning may be logged now.
    pub fn try_acquire(&self) -> Option<u64> {
        let now = self.epoch.elapsed().as_millis() as u64;
        let next_allowed = self.next_allowed.load(Ordering::Relaxed);
        if now >= next_allowed
            && self
                .next_allowed
                .compare_exchange(
                    next_allowed,
                    now + self.interval_millis,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}
