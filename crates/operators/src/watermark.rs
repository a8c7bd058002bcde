//! Event-time watermark tracking.
//!
//! A partition's watermark trails the largest timestamp it has seen by the
//! allowed lateness. The global watermark across partitions is the minimum of
//! the partition watermarks. Both only move forward.

use toprank_core::Timestamp;

/// Bounded-lateness watermark for one partition.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    allowed_lateness: Timestamp,
    max_ts: Option<Timestamp>,
    current: Timestamp,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Timestamp) -> Self {
        Self {
            allowed_lateness,
            max_ts: None,
            current: 0,
        }
    }

    /// Record an event timestamp. Returns true if the watermark advanced.
    pub fn observe(&mut self, ts: Timestamp) -> bool {
        let max_ts = self.max_ts.map_or(ts, |m| m.max(ts));
        self.max_ts = Some(max_ts);
        self.advance_to(max_ts.saturating_sub(self.allowed_lateness))
    }

    /// Move the watermark to `wm` if that is forward. Returns true if it moved.
    pub fn advance_to(&mut self, wm: Timestamp) -> bool {
        if wm > self.current {
            self.current = wm;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Timestamp {
        self.current
    }

    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.max_ts
    }
}

/// Minimum watermark over a fixed set of partitions.
#[derive(Debug, Clone)]
pub struct GlobalWatermark {
    partitions: Vec<Timestamp>,
    current: Timestamp,
}

impl GlobalWatermark {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![0; partitions.max(1)],
            current: 0,
        }
    }

    /// Update one partition. Returns the new global watermark if it advanced.
    pub fn update(&mut self, partition: usize, wm: Timestamp) -> Option<Timestamp> {
        let slot = self.partitions.get_mut(partition)?;
        *slot = (*slot).max(wm);
        self.recompute()
    }

    /// A finished partition no longer holds the global watermark back.
    pub fn finish(&mut self, partition: usize) -> Option<Timestamp> {
        self.update(partition, Timestamp::MAX)
    }

    pub fn all_finished(&self) -> bool {
        self.partitions.iter().all(|&wm| wm == Timestamp::MAX)
    }

    pub fn current(&self) -> Timestamp {
        self.current
    }

    fn recompute(&mut self) -> Option<Timestamp> {
        let min = self.partitions.iter().copied().min().unwrap_or(0);
        if min > self.current {
            self.current = min;
            Some(min)
        } else {
            None
        }
    }
}
