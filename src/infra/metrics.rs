//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Lock-free metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Pings parsed from MQTT (monotonic)
    pings_received: AtomicU64,
    /// Pings dropped: bad JSON, missing device key, full channel
    pings_ignored: AtomicU64,
    /// New door events saved
    events_emitted: AtomicU64,
    /// Pings that confirmed the current state
    checks_in: AtomicU64,
    /// Scheduled re-evaluations with no change
    unchanged: AtomicU64,
    /// New events dropped by the duplicate timestamp guard
    duplicates_skipped: AtomicU64,
    /// Compare-and-set retries after a concurrent write
    save_conflicts: AtomicU64,
    /// Door-not-closed alerts queued
    notifications_sent: AtomicU64,
    /// Alerts withheld: already sent for this event or snoozed
    notifications_suppressed: AtomicU64,
    /// Egress messages dropped because the channel was full
    egress_dropped: AtomicU64,
    /// History rows removed by retention
    history_deleted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_ping_received(&self) {
        self.pings_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ping_ignored(&self) {
        self.pings_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_check_in(&self) {
        self.checks_in.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unchanged(&self) {
        self.unchanged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate_skipped(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_save_conflict(&self) {
        self.save_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_suppressed(&self) {
        self.notifications_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_deleted(&self, count: u64) {
        self.history_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters (monotonic, never reset)
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            pings_received: self.pings_received.load(Ordering::Relaxed),
            pings_ignored: self.pings_ignored.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            checks_in: self.checks_in.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            save_conflicts: self.save_conflicts.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            history_deleted: self.history_deleted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSummary {
    pub pings_received: u64,
    pub pings_ignored: u64,
    pub events_emitted: u64,
    pub checks_in: u64,
    pub unchanged: u64,
    pub duplicates_skipped: u64,
    pub save_conflicts: u64,
    pub notifications_sent: u64,
    pub notifications_suppressed: u64,
    pub egress_dropped: u64,
    pub history_deleted: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            pings = %self.pings_received,
            ignored = %self.pings_ignored,
            events = %self.events_emitted,
            checks_in = %self.checks_in,
            unchanged = %self.unchanged,
            duplicates = %self.duplicates_skipped,
            conflicts = %self.save_conflicts,
            alerts = %self.notifications_sent,
            alerts_suppressed = %self.notifications_suppressed,
            egress_dropped = %self.egress_dropped,
            history_deleted = %self.history_deleted,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.events_emitted(), 0);
        assert_eq!(metrics.report().pings_received, 0);
    }

    #[test]
    fn test_report_is_not_reset() {
        let metrics = Metrics::new();
        metrics.record_ping_received();
        metrics.record_ping_received();
        metrics.record_event_emitted();
        metrics.record_history_deleted(7);

        let first = metrics.report();
        assert_eq!(first.pings_received, 2);
        assert_eq!(first.events_emitted, 1);
        assert_eq!(first.history_deleted, 7);
        assert_eq!(metrics.report(), first);
    }
}
