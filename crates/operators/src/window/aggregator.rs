//! Per-window key counting.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use toprank_core::{KeyedEvent, OverflowPolicy, TimeWindow, Timestamp, TopKConfig};
use tracing::debug;

use super::SlidingWindowAssigner;
use crate::metrics::WindowMetrics;
use crate::watermark::WatermarkTracker;

/// Recency order of a window's keys, used to evict under a key cap.
#[derive(Debug, Default)]
struct KeyRecency {
    by_seq: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
}

impl KeyRecency {
    fn touch(&mut self, key: &str, seq: u64) {
        if let Some(old) = self.seq_of.insert(key.to_string(), seq) {
            self.by_seq.remove(&old);
        }
        self.by_seq.insert(seq, key.to_string());
    }

    fn pop_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.by_seq.pop_first()?;
        self.seq_of.remove(&key);
        Some(key)
    }
}

/// Live counts of one window.
#[derive(Debug)]
pub struct WindowState {
    window: TimeWindow,
    counts: HashMap<String, u64>,
    last_updated: Timestamp,
    recency: Option<KeyRecency>,
}

impl WindowState {
    fn new(window: TimeWindow, track_recency: bool) -> Self {
        Self {
            window,
            counts: HashMap::new(),
            last_updated: 0,
            recency: track_recency.then(KeyRecency::default),
        }
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.counts
    }

    /// Largest event timestamp merged into this window.
    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    fn would_overflow(&self, key: &str, max_keys: usize) -> bool {
        !self.counts.contains_key(key) && self.counts.len() >= max_keys
    }

    /// Count one occurrence of `key`. Returns the key evicted to make room, if any.
    fn increment(
        &mut self,
        key: &str,
        ts: Timestamp,
        seq: u64,
        max_keys: Option<usize>,
    ) -> Option<String> {
        let mut evicted = None;
        if let Some(max_keys) = max_keys {
            if self.would_overflow(key, max_keys) {
                evicted = self.recency.as_mut().and_then(KeyRecency::pop_least_recent);
                if let Some(old) = &evicted {
                    self.counts.remove(old);
                }
            }
        }

        match self.counts.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(key.to_string(), 1);
            }
        }
        if let Some(recency) = self.recency.as_mut() {
            recency.touch(key, seq);
        }
        self.last_updated = self.last_updated.max(ts);
        evicted
    }
}

/// Outcome of applying one event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Windows the event was counted in.
    pub applied: usize,
    /// Windows that had already closed.
    pub late: usize,
}

/// Owns the open windows of one partition and the partition's watermark.
///
/// A window is closed once `end <= watermark`, or once it has been
/// force-closed; force-closing always takes the oldest window, so closed
/// windows form a prefix in start order.
pub struct WindowAggregator {
    assigner: SlidingWindowAssigner,
    watermark: WatermarkTracker,
    open: BTreeMap<TimeWindow, WindowState>,
    forced_through: Option<Timestamp>,
    max_keys: Option<usize>,
    overflow_policy: OverflowPolicy,
    seq: u64,
    metrics: WindowMetrics,
}

impl WindowAggregator {
    pub fn new(config: &TopKConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            assigner: SlidingWindowAssigner::from_config(config)?,
            watermark: WatermarkTracker::new(config.allowed_lateness),
            open: BTreeMap::new(),
            forced_through: None,
            max_keys: config.max_distinct_keys_per_window,
            overflow_policy: config.overflow_policy,
            seq: 0,
            metrics: WindowMetrics::default(),
        })
    }

    pub fn assigner(&self) -> &SlidingWindowAssigner {
        &self.assigner
    }

    pub fn watermark(&self) -> Timestamp {
        self.watermark.current()
    }

    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut WindowMetrics {
        &mut self.metrics
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, window: &TimeWindow) -> bool {
        self.open.contains_key(window)
    }

    /// Whether `window` can no longer accept events.
    pub fn is_closed(&self, window: &TimeWindow) -> bool {
        window.end <= self.watermark.current()
            || self.forced_through.is_some_and(|start| window.start <= start)
    }

    pub fn state(&self, window: &TimeWindow) -> Option<&WindowState> {
        self.open.get(window)
    }

    /// Count `event` in every open window it belongs to, then advance the watermark.
    ///
    /// Late assignments are dropped and counted. Events too close to
    /// `Timestamp::MAX` to have a representable window end are dropped as
    /// malformed and leave the watermark untouched. The only error is a
    /// key-cap overflow under [`OverflowPolicy::Strict`], detected before any
    /// window is modified.
    pub fn apply(&mut self, event: &KeyedEvent) -> Result<ApplyOutcome> {
        let windows = match self.assigner.assign(event.ts) {
            Ok(windows) => windows,
            Err(e) => {
                self.metrics.malformed_records += 1;
                debug!(ts = event.ts, error = %e, "dropping unassignable event");
                return Ok(ApplyOutcome::default());
            }
        };

        if let (Some(max_keys), OverflowPolicy::Strict) = (self.max_keys, self.overflow_policy) {
            for window in &windows {
                if let Some(state) = self.open.get(window) {
                    if state.would_overflow(&event.key, max_keys) {
                        bail!(
                            "window {} exceeded {} distinct keys at key {:?}",
                            window,
                            max_keys,
                            event.key
                        );
                    }
                }
            }
        }

        let mut outcome = ApplyOutcome::default();
        for window in windows {
            if self.is_closed(&window) {
                outcome.late += 1;
                continue;
            }

            let track_recency = self.max_keys.is_some();
            let metrics = &mut self.metrics;
            let state = self.open.entry(window).or_insert_with(|| {
                metrics.windows_opened += 1;
                debug!(%window, "window opened");
                WindowState::new(window, track_recency)
            });

            self.seq += 1;
            if let Some(evicted) = state.increment(&event.key, event.ts, self.seq, self.max_keys) {
                self.metrics.evicted_keys += 1;
                debug!(%window, key = %evicted, "evicted least recently updated key");
            }
            outcome.applied += 1;
        }

        self.metrics.late_assignments += outcome.late as u64;
        if outcome.applied == 0 {
            self.metrics.late_events += 1;
        } else {
            self.metrics.events_applied += 1;
        }

        self.watermark.observe(event.ts);
        Ok(outcome)
    }

    /// Advance the watermark from an upstream signal. Returns true if it moved.
    pub fn advance_watermark(&mut self, wm: Timestamp) -> bool {
        self.watermark.advance_to(wm)
    }

    /// Remove every window the watermark has passed, in start order.
    pub fn take_closable(&mut self) -> Vec<WindowState> {
        let wm = self.watermark.current();
        let mut ready = Vec::new();
        while let Some(entry) = self.open.first_entry() {
            if entry.key().end > wm {
                break;
            }
            ready.push(entry.remove());
        }
        ready
    }

    /// Close the oldest open window ahead of the watermark.
    pub fn force_close_oldest(&mut self) -> Option<WindowState> {
        let (window, state) = self.open.pop_first()?;
        self.forced_through = Some(self.forced_through.map_or(window.start, |s| s.max(window.start)));
        self.metrics.forced_closes += 1;
        Some(state)
    }

    /// Remove every open window, in start order. Nothing is accepted afterwards.
    pub fn take_all(&mut self) -> Vec<WindowState> {
        let open = std::mem::take(&mut self.open);
        if let Some(last) = open.keys().next_back() {
            self.forced_through = Some(self.forced_through.map_or(last.start, |s| s.max(last.start)));
        }
        open.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ev(key: &str, ts: Timestamp) -> KeyedEvent {
        KeyedEvent::new(ts, key.to_string(), Bytes::new())
    }

    fn aggregator(config: TopKConfig) -> WindowAggregator {
        WindowAggregator::new(&config).unwrap()
    }

    #[test]
    fn test_apply_counts_in_every_assigned_window() {
        let mut agg = aggregator(TopKConfig::sliding(30, 5, 1).with_allowed_lateness(100));
        agg.apply(&ev("x", 0)).unwrap();
        agg.apply(&ev("y", 3)).unwrap();
        let outcome = agg.apply(&ev("x", 7)).unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 2, late: 0 });

        let w0 = agg.state(&TimeWindow::new(0, 30)).unwrap();
        assert_eq!(w0.counts().get("x"), Some(&2));
        assert_eq!(w0.counts().get("y"), Some(&1));
        assert_eq!(w0.last_updated(), 7);

        let w5 = agg.state(&TimeWindow::new(5, 35)).unwrap();
        assert_eq!(w5.total(), 1);
        assert_eq!(agg.open_windows(), 2);
        assert_eq!(agg.metrics().windows_opened, 2);
    }

    #[test]
    fn test_window_sum_equals_assigned_events() {
        let mut agg = aggregator(TopKConfig::sliding(20, 5, 3).with_allowed_lateness(1_000));
        let keys = ["a", "b", "c"];
        for ts in 0..60u64 {
            agg.apply(&ev(keys[(ts % 3) as usize], ts)).unwrap();
        }
        let window = TimeWindow::new(10, 30);
        assert_eq!(agg.state(&window).unwrap().total(), 20);
    }

    #[test]
    fn test_late_event_is_dropped_and_counted() {
        let mut agg = aggregator(TopKConfig::sliding(10, 5, 1));
        agg.apply(&ev("a", 22)).unwrap();
        assert_eq!(agg.watermark(), 22);

        // 12 belongs to [5,15) and [10,20), both closed by watermark 22.
        let outcome = agg.apply(&ev("late", 12)).unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 0, late: 2 });
        assert_eq!(agg.metrics().late_events, 1);
        assert_eq!(agg.metrics().late_assignments, 2);

        // 18 belongs to [15,25) (open) and [10,20) (closed).
        let outcome = agg.apply(&ev("partial", 18)).unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 1, late: 1 });
        assert_eq!(agg.metrics().events_applied, 2);
    }

    #[test]
    fn test_allowed_lateness_keeps_windows_open() {
        let mut agg = aggregator(TopKConfig::sliding(10, 5, 1).with_allowed_lateness(5));
        agg.apply(&ev("a", 22)).unwrap();
        assert_eq!(agg.watermark(), 17);
        let outcome = agg.apply(&ev("b", 12)).unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 1, late: 1 });
    }

    #[test]
    fn test_take_closable_in_start_order() {
        let mut agg = aggregator(TopKConfig::sliding(10, 5, 1).with_allowed_lateness(100));
        for ts in [3, 8, 14, 19] {
            agg.apply(&ev("k", ts)).unwrap();
        }
        assert!(agg.take_closable().is_empty());
        assert!(agg.advance_watermark(15));
        let closed: Vec<_> = agg.take_closable().iter().map(|s| s.window()).collect();
        assert_eq!(closed, vec![TimeWindow::new(0, 10), TimeWindow::new(5, 15)]);
        assert!(!agg.advance_watermark(12));
    }

    #[test]
    fn test_evicts_least_recently_updated_key() {
        let mut agg = aggregator(
            TopKConfig::sliding(10, 10, 1)
                .with_allowed_lateness(100)
                .with_max_keys(2, OverflowPolicy::Evict),
        );
        agg.apply(&ev("a", 1)).unwrap();
        agg.apply(&ev("b", 2)).unwrap();
        agg.apply(&ev("a", 3)).unwrap();
        agg.apply(&ev("c", 4)).unwrap();

        let state = agg.state(&TimeWindow::new(0, 10)).unwrap();
        assert_eq!(state.counts().len(), 2);
        assert_eq!(state.counts().get("a"), Some(&2));
        assert_eq!(state.counts().get("c"), Some(&1));
        assert!(!state.counts().contains_key("b"));
        assert_eq!(agg.metrics().evicted_keys, 1);
    }

    #[test]
    fn test_strict_overflow_fails_without_partial_update() {
        let mut agg = aggregator(
            TopKConfig::sliding(10, 5, 1)
                .with_allowed_lateness(100)
                .with_max_keys(1, OverflowPolicy::Strict),
        );
        agg.apply(&ev("a", 6)).unwrap();
        let err = agg.apply(&ev("b", 7)).unwrap_err();
        assert!(err.to_string().contains("distinct keys"));
        assert_eq!(agg.state(&TimeWindow::new(5, 15)).unwrap().total(), 1);
        assert_eq!(agg.state(&TimeWindow::new(0, 10)).unwrap().total(), 1);
    }

    #[test]
    fn test_forced_close_rejects_older_windows() {
        let mut agg = aggregator(TopKConfig::sliding(10, 5, 1).with_allowed_lateness(100));
        agg.apply(&ev("a", 7)).unwrap();
        let forced = agg.force_close_oldest().unwrap();
        assert_eq!(forced.window(), TimeWindow::new(0, 10));
        assert!(agg.is_closed(&TimeWindow::new(0, 10)));
        assert!(!agg.is_closed(&TimeWindow::new(5, 15)));

        let outcome = agg.apply(&ev("b", 2)).unwrap();
        assert_eq!(outcome.late, 1);
        assert_eq!(agg.metrics().forced_closes, 1);
    }

    #[test]
    fn test_timestamp_near_max_is_dropped_as_malformed() {
        let mut agg = aggregator(TopKConfig::sliding(30, 5, 1));
        agg.apply(&ev("a", 10)).unwrap();

        let outcome = agg.apply(&ev("x", Timestamp::MAX - 1)).unwrap();
        assert_eq!(outcome, ApplyOutcome::default());
        assert_eq!(agg.metrics().malformed_records, 1);
        assert_eq!(agg.watermark(), 10);
        assert_eq!(agg.open_windows(), 3);
    }

    #[test]
    fn test_batching_does_not_change_counts() {
        let events: Vec<KeyedEvent> = (0..40u64)
            .map(|i| ev(["p", "q", "r", "p"][(i % 4) as usize], i / 2))
            .collect();
        let config = TopKConfig::sliding(10, 5, 2).with_allowed_lateness(1_000);

        let mut one_by_one = aggregator(config.clone());
        for e in &events {
            one_by_one.apply(e).unwrap();
        }

        let mut batched = aggregator(config);
        for chunk in events.chunks(7) {
            for e in chunk {
                batched.apply(e).unwrap();
            }
            batched.take_closable();
        }

        let window = TimeWindow::new(5, 15);
        assert_eq!(
            one_by_one.state(&window).unwrap().counts(),
            batched.state(&window).unwrap().counts()
        );
    }
}
