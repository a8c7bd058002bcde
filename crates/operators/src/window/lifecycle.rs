//! Window closing, emission and cleanup.
//!
//! Windows move through `Pending -> Open -> Closing -> Closed`:
//! - `Pending`: no event yet, nothing materialized.
//! - `Open`: owns a [`WindowState`] in the aggregator.
//! - `Closing`: the watermark passed its end; its ranking is computed and
//!   waiting for the sink to accept it.
//! - `Closed`: emitted (or abandoned). Retained for `closed_retention`
//!   watermark units when configured, then dropped.
//!
//! Rankings are delivered strictly in window start order. A failed delivery
//! blocks later windows until it succeeds or is abandoned.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use toprank_core::{DrainPolicy, KeyedEvent, RankedWindow, TimeWindow, Timestamp, TopKConfig};
use toprank_runtime::Emitter;
use tracing::{debug, warn};

use super::aggregator::{WindowAggregator, WindowState};
use super::topk::rank;
use crate::metrics::WindowMetrics;

/// Receiver of closed-window rankings.
#[async_trait]
pub trait RankingSink: Send {
    async fn deliver(&mut self, ranked: RankedWindow) -> Result<()>;
}

#[async_trait]
impl RankingSink for Emitter<RankedWindow> {
    async fn deliver(&mut self, ranked: RankedWindow) -> Result<()> {
        self.data(ranked).await
    }
}

#[async_trait]
impl RankingSink for Vec<RankedWindow> {
    async fn deliver(&mut self, ranked: RankedWindow) -> Result<()> {
        self.push(ranked);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Pending,
    Open,
    Closing,
    Closed,
}

struct ClosingWindow {
    result: RankedWindow,
    attempts: u32,
    state: WindowState,
}

struct RetainedWindow {
    state: WindowState,
    late_events: u64,
}

/// Drives one partition's windows from first event to cleanup.
pub struct WindowLifecycle {
    aggregator: WindowAggregator,
    k: usize,
    open_limit: usize,
    max_emit_attempts: u32,
    closed_retention: Timestamp,
    drain_policy: DrainPolicy,
    closing: VecDeque<ClosingWindow>,
    retained: BTreeMap<TimeWindow, RetainedWindow>,
}

impl WindowLifecycle {
    pub fn new(config: &TopKConfig) -> Result<Self> {
        Ok(Self {
            aggregator: WindowAggregator::new(config)?,
            k: config.k,
            open_limit: config.open_window_limit(),
            max_emit_attempts: config.max_emit_attempts,
            closed_retention: config.closed_retention,
            drain_policy: config.drain_policy,
            closing: VecDeque::new(),
            retained: BTreeMap::new(),
        })
    }

    pub fn watermark(&self) -> Timestamp {
        self.aggregator.watermark()
    }

    pub fn metrics(&self) -> &WindowMetrics {
        self.aggregator.metrics()
    }

    pub fn open_windows(&self) -> usize {
        self.aggregator.open_windows()
    }

    /// Rankings computed but not yet accepted by a sink.
    pub fn pending_results(&self) -> usize {
        self.closing.len()
    }

    /// Windows past the close frontier report `Closed` whether or not they held events.
    pub fn phase(&self, window: &TimeWindow) -> WindowPhase {
        if self.aggregator.is_open(window) {
            WindowPhase::Open
        } else if self.closing.iter().any(|c| c.result.window == *window) {
            WindowPhase::Closing
        } else if self.retained.contains_key(window) || self.aggregator.is_closed(window) {
            WindowPhase::Closed
        } else {
            WindowPhase::Pending
        }
    }

    /// Counts of an open or retained window.
    pub fn counts(&self, window: &TimeWindow) -> Option<&HashMap<String, u64>> {
        self.aggregator
            .state(window)
            .or_else(|| self.retained.get(window).map(|r| &r.state))
            .map(WindowState::counts)
    }

    /// Late events that targeted a retained closed window.
    pub fn late_events_for(&self, window: &TimeWindow) -> Option<u64> {
        self.retained.get(window).map(|r| r.late_events)
    }

    /// Apply one event and move any window it closed to `Closing`.
    pub fn on_event(&mut self, event: &KeyedEvent) -> Result<()> {
        if !self.retained.is_empty() {
            if let Ok(windows) = self.aggregator.assigner().assign(event.ts) {
                for window in windows {
                    if let Some(retained) = self.retained.get_mut(&window) {
                        retained.late_events += 1;
                    }
                }
            }
        }

        self.aggregator.apply(event)?;

        // Windows the watermark already passed do not count against the cap.
        for state in self.aggregator.take_closable() {
            self.begin_closing(state);
        }
        while self.aggregator.open_windows() > self.open_limit {
            match self.aggregator.force_close_oldest() {
                Some(state) => {
                    warn!(
                        window = %state.window(),
                        limit = self.open_limit,
                        "open window limit reached, closing early"
                    );
                    self.begin_closing(state);
                }
                None => break,
            }
        }

        self.close_ready();
        Ok(())
    }

    /// Advance the watermark from upstream. Returns true if it moved.
    pub fn on_watermark(&mut self, wm: Timestamp) -> bool {
        let advanced = self.aggregator.advance_watermark(wm);
        if advanced {
            self.close_ready();
        }
        advanced
    }

    fn close_ready(&mut self) {
        for state in self.aggregator.take_closable() {
            self.begin_closing(state);
        }
        self.collect_garbage();
    }

    fn begin_closing(&mut self, state: WindowState) {
        let window = state.window();
        let ranking = rank(state.counts(), self.k);
        if ranking.is_empty() {
            self.aggregator.metrics_mut().empty_windows_suppressed += 1;
            debug!(%window, "empty window suppressed");
            self.retain(state);
            return;
        }
        debug!(%window, keys = state.counts().len(), "window closing");
        self.closing.push_back(ClosingWindow {
            result: RankedWindow::new(window, ranking),
            attempts: 0,
            state,
        });
    }

    /// Deliver every `Closing` window in order. Returns the number delivered.
    ///
    /// On failure the window stays `Closing` and the error is returned; once it
    /// has failed `max_emit_attempts` times it is abandoned and counted as a
    /// dropped result.
    pub async fn fire<S: RankingSink>(&mut self, sink: &mut S) -> Result<usize> {
        let mut delivered = 0;
        while let Some(front) = self.closing.front_mut() {
            let window = front.result.window;
            match sink.deliver(front.result.clone()).await {
                Ok(()) => {
                    if let Some(done) = self.closing.pop_front() {
                        self.aggregator.metrics_mut().windows_emitted += 1;
                        debug!(%window, "window closed");
                        self.retain(done.state);
                    }
                    delivered += 1;
                }
                Err(e) => {
                    front.attempts += 1;
                    let attempts = front.attempts;
                    if attempts >= self.max_emit_attempts {
                        if let Some(abandoned) = self.closing.pop_front() {
                            self.aggregator.metrics_mut().dropped_results += 1;
                            warn!(%window, attempts, error = %e, "abandoning window result");
                            self.retain(abandoned.state);
                        }
                        return Err(e).with_context(|| {
                            format!("result for window {} abandoned after {} attempts", window, attempts)
                        });
                    }
                    return Err(e).with_context(|| format!("failed to emit window {}", window));
                }
            }
        }
        Ok(delivered)
    }

    /// Shut down: flush or discard open windows per the drain policy, then
    /// [`deliver_pending`](Self::deliver_pending).
    pub async fn drain<S: RankingSink>(&mut self, sink: &mut S) -> Result<()> {
        let open = self.aggregator.take_all();
        match self.drain_policy {
            DrainPolicy::Flush => {
                for state in open {
                    self.begin_closing(state);
                }
            }
            DrainPolicy::Discard => {
                debug!(windows = open.len(), "discarding open windows");
                self.aggregator.metrics_mut().discarded_windows += open.len() as u64;
            }
        }

        self.deliver_pending(sink).await
    }

    /// Deliver every `Closing` window, retrying each up to the attempt limit.
    ///
    /// Transient failures are absorbed. Returns an error if any result had
    /// to be abandoned; nothing is left `Closing` either way.
    pub async fn deliver_pending<S: RankingSink>(&mut self, sink: &mut S) -> Result<()> {
        let dropped_before = self.metrics().dropped_results;
        let mut last_error = None;
        while !self.closing.is_empty() {
            match self.fire(sink).await {
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "emission failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if self.metrics().dropped_results > dropped_before => Err(e),
            _ => Ok(()),
        }
    }

    fn retain(&mut self, state: WindowState) {
        if self.closed_retention > 0 {
            self.retained.insert(
                state.window(),
                RetainedWindow {
                    state,
                    late_events: 0,
                },
            );
        }
    }

    fn collect_garbage(&mut self) {
        if self.retained.is_empty() {
            return;
        }
        let wm = self.aggregator.watermark();
        let retention = self.closed_retention;
        self.retained
            .retain(|window, _| window.end.saturating_add(retention) > wm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use toprank_core::{KeyCount, OverflowPolicy};

    fn ev(key: &str, ts: Timestamp) -> KeyedEvent {
        KeyedEvent::new(ts, key.to_string(), Bytes::new())
    }

    /// Fails the first `failures` deliveries.
    struct FlakySink {
        failures: usize,
        delivered: Vec<RankedWindow>,
    }

    #[async_trait]
    impl RankingSink for FlakySink {
        async fn deliver(&mut self, ranked: RankedWindow) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                anyhow::bail!("sink unavailable");
            }
            self.delivered.push(ranked);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let config = TopKConfig::sliding(30, 5, 1);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        for (key, ts) in [("x", 0), ("y", 3), ("x", 7)] {
            lc.on_event(&ev(key, ts)).unwrap();
            lc.fire(&mut out).await.unwrap();
        }
        assert!(out.is_empty());
        assert_eq!(lc.phase(&TimeWindow::new(0, 30)), WindowPhase::Open);
        assert_eq!(lc.phase(&TimeWindow::new(10, 40)), WindowPhase::Pending);

        lc.on_event(&ev("y", 31)).unwrap();
        lc.fire(&mut out).await.unwrap();
        assert_eq!(
            out,
            vec![RankedWindow::new(
                TimeWindow::new(0, 30),
                vec![KeyCount::new("x", 2)]
            )]
        );

        // Remaining windows: [5,35) {x:1, y:1}, then [10,40)..[30,60) {y:1}.
        lc.on_watermark(1_000);
        lc.fire(&mut out).await.unwrap();
        let expected = vec![
            RankedWindow::new(TimeWindow::new(0, 30), vec![KeyCount::new("x", 2)]),
            RankedWindow::new(TimeWindow::new(5, 35), vec![KeyCount::new("x", 1)]),
            RankedWindow::new(TimeWindow::new(10, 40), vec![KeyCount::new("y", 1)]),
            RankedWindow::new(TimeWindow::new(15, 45), vec![KeyCount::new("y", 1)]),
            RankedWindow::new(TimeWindow::new(20, 50), vec![KeyCount::new("y", 1)]),
            RankedWindow::new(TimeWindow::new(25, 55), vec![KeyCount::new("y", 1)]),
            RankedWindow::new(TimeWindow::new(30, 60), vec![KeyCount::new("y", 1)]),
        ];
        assert_eq!(out, expected);
        assert_eq!(lc.metrics().windows_emitted, 7);
        assert_eq!(lc.phase(&TimeWindow::new(0, 30)), WindowPhase::Closed);
    }

    #[tokio::test]
    async fn test_late_event_never_reaches_emitted_result() {
        let config = TopKConfig::sliding(10, 10, 2).with_allowed_lateness(5);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 2)).unwrap();
        lc.on_event(&ev("a", 4)).unwrap();
        // Still within lateness: watermark is 7.
        lc.on_event(&ev("b", 12)).unwrap();
        lc.on_event(&ev("c", 9)).unwrap();
        // Watermark 15 closes [0,10); `d` arrives before the ranking is emitted.
        lc.on_event(&ev("z", 20)).unwrap();
        lc.on_event(&ev("d", 1)).unwrap();
        lc.fire(&mut out).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].ranking,
            vec![KeyCount::new("a", 2), KeyCount::new("c", 1)]
        );
        assert_eq!(lc.metrics().late_events, 1);
    }

    #[tokio::test]
    async fn test_failed_emission_is_retried_then_delivered() {
        let config = TopKConfig::sliding(10, 10, 1);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut sink = FlakySink {
            failures: 2,
            delivered: Vec::new(),
        };

        lc.on_event(&ev("a", 1)).unwrap();
        lc.on_event(&ev("b", 11)).unwrap();
        lc.on_event(&ev("c", 21)).unwrap();
        assert_eq!(lc.pending_results(), 2);

        assert!(lc.fire(&mut sink).await.is_err());
        assert_eq!(lc.phase(&TimeWindow::new(0, 10)), WindowPhase::Closing);
        assert!(lc.fire(&mut sink).await.is_err());
        assert_eq!(lc.fire(&mut sink).await.unwrap(), 2);

        let windows: Vec<_> = sink.delivered.iter().map(|r| r.window.start).collect();
        assert_eq!(windows, vec![0, 10]);
        assert_eq!(lc.metrics().dropped_results, 0);
    }

    #[tokio::test]
    async fn test_result_abandoned_after_max_attempts() {
        let mut config = TopKConfig::sliding(10, 10, 1);
        config.max_emit_attempts = 2;
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut sink = FlakySink {
            failures: 2,
            delivered: Vec::new(),
        };

        lc.on_event(&ev("a", 1)).unwrap();
        lc.on_event(&ev("b", 11)).unwrap();
        lc.on_event(&ev("c", 21)).unwrap();

        assert!(lc.fire(&mut sink).await.is_err());
        let err = lc.fire(&mut sink).await.unwrap_err();
        assert!(err.to_string().contains("abandoned"));
        assert_eq!(lc.metrics().dropped_results, 1);

        assert_eq!(lc.fire(&mut sink).await.unwrap(), 1);
        assert_eq!(sink.delivered[0].window, TimeWindow::new(10, 20));
    }

    #[tokio::test]
    async fn test_deliver_pending_absorbs_transient_failures() {
        let config = TopKConfig::sliding(10, 10, 1);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut sink = FlakySink {
            failures: 2,
            delivered: Vec::new(),
        };

        lc.on_event(&ev("a", 1)).unwrap();
        lc.on_event(&ev("b", 11)).unwrap();
        lc.deliver_pending(&mut sink).await.unwrap();

        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(lc.pending_results(), 0);
        assert_eq!(lc.metrics().dropped_results, 0);
    }

    #[tokio::test]
    async fn test_deliver_pending_abandons_every_result_of_a_dead_sink() {
        let mut config = TopKConfig::sliding(10, 10, 1);
        config.max_emit_attempts = 2;
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut sink = FlakySink {
            failures: usize::MAX,
            delivered: Vec::new(),
        };

        lc.on_event(&ev("a", 1)).unwrap();
        lc.on_event(&ev("b", 11)).unwrap();
        lc.on_event(&ev("c", 21)).unwrap();
        assert_eq!(lc.pending_results(), 2);

        assert!(lc.deliver_pending(&mut sink).await.is_err());
        assert_eq!(lc.pending_results(), 0);
        assert_eq!(lc.metrics().dropped_results, 2);
        assert_eq!(lc.phase(&TimeWindow::new(0, 10)), WindowPhase::Closed);
    }

    #[tokio::test]
    async fn test_drain_flush_emits_partial_windows() {
        let config = TopKConfig::sliding(20, 10, 1);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 12)).unwrap();
        lc.on_event(&ev("a", 13)).unwrap();
        lc.drain(&mut out).await.unwrap();

        let windows: Vec<_> = out.iter().map(|r| r.window).collect();
        assert_eq!(windows, vec![TimeWindow::new(0, 20), TimeWindow::new(10, 30)]);
        assert_eq!(lc.open_windows(), 0);
    }

    #[tokio::test]
    async fn test_drain_discard_drops_open_windows() {
        let config = TopKConfig::sliding(20, 10, 1).with_drain_policy(DrainPolicy::Discard);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 12)).unwrap();
        lc.drain(&mut out).await.unwrap();

        assert!(out.is_empty());
        assert_eq!(lc.metrics().discarded_windows, 2);
    }

    #[tokio::test]
    async fn test_retained_window_records_late_events_until_expiry() {
        let config = TopKConfig::sliding(10, 10, 1).with_closed_retention(20);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();
        let first = TimeWindow::new(0, 10);

        lc.on_event(&ev("a", 3)).unwrap();
        lc.on_event(&ev("b", 15)).unwrap();
        lc.fire(&mut out).await.unwrap();
        assert_eq!(lc.late_events_for(&first), Some(0));

        lc.on_event(&ev("late", 4)).unwrap();
        assert_eq!(lc.late_events_for(&first), Some(1));
        assert_eq!(lc.counts(&first).unwrap().get("late"), None);

        lc.on_watermark(30);
        assert_eq!(lc.late_events_for(&first), None);
    }

    #[tokio::test]
    async fn test_open_window_cap_forces_oldest_closed() {
        let mut config = TopKConfig::sliding(10, 5, 1).with_allowed_lateness(100);
        config.max_open_windows = Some(2);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 7)).unwrap();
        lc.on_event(&ev("b", 12)).unwrap();
        lc.fire(&mut out).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window, TimeWindow::new(0, 10));
        assert_eq!(lc.open_windows(), 2);
        assert_eq!(lc.metrics().forced_closes, 1);
    }

    #[tokio::test]
    async fn test_gap_in_traffic_closes_windows_without_forcing() {
        let config = TopKConfig::sliding(30, 5, 1);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        for ts in [0, 7, 1_000] {
            lc.on_event(&ev("x", ts)).unwrap();
        }
        lc.fire(&mut out).await.unwrap();

        let windows: Vec<_> = out.iter().map(|r| r.window).collect();
        assert_eq!(windows, vec![TimeWindow::new(0, 30), TimeWindow::new(5, 35)]);
        assert_eq!(lc.open_windows(), 6);
        assert_eq!(lc.metrics().forced_closes, 0);
    }

    #[tokio::test]
    async fn test_timestamp_near_max_is_dropped() {
        let config = TopKConfig::sliding(10, 10, 1).with_closed_retention(20);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 3)).unwrap();
        lc.on_event(&ev("b", 15)).unwrap();
        lc.fire(&mut out).await.unwrap();

        lc.on_event(&ev("x", Timestamp::MAX - 1)).unwrap();
        lc.on_event(&ev("y", Timestamp::MAX)).unwrap();
        assert_eq!(lc.metrics().malformed_records, 2);
        assert_eq!(lc.watermark(), 15);
        assert_eq!(lc.pending_results(), 0);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_key_absent_from_ranking() {
        let config = TopKConfig::sliding(10, 10, 1).with_max_keys(1, OverflowPolicy::Evict);
        let mut lc = WindowLifecycle::new(&config).unwrap();
        let mut out: Vec<RankedWindow> = Vec::new();

        lc.on_event(&ev("a", 1)).unwrap();
        lc.on_event(&ev("b", 2)).unwrap();
        lc.on_event(&ev("c", 11)).unwrap();
        lc.fire(&mut out).await.unwrap();

        assert_eq!(out[0].ranking, vec![KeyCount::new("b", 1)]);
        assert_eq!(lc.metrics().evicted_keys, 1);
        assert_eq!(lc.metrics().empty_windows_suppressed, 0);
    }
}
