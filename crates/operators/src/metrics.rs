//! Counters for dropped, evicted and emitted data.

use parking_lot::RwLock;
use std::ops::AddAssign;
use std::sync::Arc;

/// Per-operator counters. Drops are reported here, never as errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WindowMetrics {
    /// Events merged into at least one window.
    pub events_applied: u64,
    /// Events that were late for every window they belong to.
    pub late_events: u64,
    /// (event, window) assignments dropped because the window had closed.
    pub late_assignments: u64,
    /// Records the key extractor rejected.
    pub malformed_records: u64,
    /// Keys evicted by the per-window key cap.
    pub evicted_keys: u64,
    pub windows_opened: u64,
    pub windows_emitted: u64,
    pub empty_windows_suppressed: u64,
    /// Windows closed early because the open-window cap was hit.
    pub forced_closes: u64,
    /// Open windows dropped on shutdown under the discard policy.
    pub discarded_windows: u64,
    /// Results abandoned after exhausting emission attempts.
    pub dropped_results: u64,
}

impl AddAssign<&WindowMetrics> for WindowMetrics {
    fn add_assign(&mut self, other: &WindowMetrics) {
        self.events_applied += other.events_applied;
        self.late_events += other.late_events;
        self.late_assignments += other.late_assignments;
        self.malformed_records += other.malformed_records;
        self.evicted_keys += other.evicted_keys;
        self.windows_opened += other.windows_opened;
        self.windows_emitted += other.windows_emitted;
        self.empty_windows_suppressed += other.empty_windows_suppressed;
        self.forced_closes += other.forced_closes;
        self.discarded_windows += other.discarded_windows;
        self.dropped_results += other.dropped_results;
    }
}

/// Metrics readable from outside the operator task.
pub type SharedMetrics = Arc<RwLock<WindowMetrics>>;

pub fn shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(WindowMetrics::default()))
}
