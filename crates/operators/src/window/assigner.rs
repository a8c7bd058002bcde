//! Sliding window assignment.

use anyhow::{bail, Result};
use toprank_core::{TimeWindow, Timestamp, TopKConfig};

/// Assigns timestamps to fixed-size windows that start every `slide` units.
///
/// Stateless: the same timestamp always maps to the same windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowAssigner {
    size: Timestamp,
    slide: Timestamp,
}

impl SlidingWindowAssigner {
    /// Create an assigner. `size` must be a positive multiple of `slide`.
    pub fn new(size: Timestamp, slide: Timestamp) -> Result<Self> {
        if slide == 0 {
            bail!("slide interval must be greater than 0");
        }
        if size == 0 || size % slide != 0 {
            bail!(
                "window size {} must be a positive multiple of slide interval {}",
                size,
                slide
            );
        }
        Ok(Self { size, slide })
    }

    pub fn from_config(config: &TopKConfig) -> Result<Self> {
        Self::new(config.window_size, config.slide_interval)
    }

    pub fn size(&self) -> Timestamp {
        self.size
    }

    pub fn slide(&self) -> Timestamp {
        self.slide
    }

    /// Starts of every window containing `ts`, latest first.
    ///
    /// Starts that would fall before time 0 are skipped, so early timestamps
    /// belong to fewer than `size / slide` windows.
    pub fn assign_starts(&self, ts: Timestamp) -> Vec<Timestamp> {
        let last_start = (ts / self.slide) * self.slide;
        (0..self.size / self.slide)
            .map_while(|i| last_start.checked_sub(i * self.slide))
            .collect()
    }

    /// Windows containing `ts`, latest first.
    ///
    /// Fails when the latest window would end past `Timestamp::MAX`, so the
    /// last usable timestamp is a little under one window size from the top.
    pub fn assign(&self, ts: Timestamp) -> Result<Vec<TimeWindow>> {
        self.assign_starts(ts)
            .into_iter()
            .map(|start| match start.checked_add(self.size) {
                Some(end) => Ok(TimeWindow::new(start, end)),
                None => bail!("timestamp {} is too large for window size {}", ts, self.size),
            })
            .collect()
    }
}

/// One-shot form of [`SlidingWindowAssigner::assign_starts`].
pub fn assign(ts: Timestamp, size: Timestamp, slide: Timestamp) -> Result<Vec<Timestamp>> {
    Ok(SlidingWindowAssigner::new(size, slide)?.assign_starts(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_timestamps() {
        let assigner = SlidingWindowAssigner::new(30, 5).unwrap();
        assert_eq!(assigner.assign_starts(0), vec![0]);
        assert_eq!(assigner.assign_starts(4), vec![0]);
        assert_eq!(assigner.assign_starts(5), vec![5, 0]);
        assert_eq!(assigner.assign_starts(7), vec![5, 0]);
        assert_eq!(assigner.assign_starts(31), vec![30, 25, 20, 15, 10, 5]);
    }

    #[test]
    fn test_full_window_count_after_warmup() {
        let assigner = SlidingWindowAssigner::new(30, 5).unwrap();
        for ts in 25..200 {
            let windows = assigner.assign(ts).unwrap();
            assert_eq!(windows.len(), 6, "ts={}", ts);
            assert!(windows.iter().all(|w| w.contains(ts)));
        }
    }

    #[test]
    fn test_matches_closed_form() {
        let (size, slide) = (20, 4);
        let assigner = SlidingWindowAssigner::new(size, slide).unwrap();
        for ts in 0..100u64 {
            let expected: Vec<u64> = (0..size / slide)
                .filter_map(|i| ((ts / slide) * slide).checked_sub(i * slide))
                .collect();
            assert_eq!(assigner.assign_starts(ts), expected);
        }
    }

    #[test]
    fn test_tumbling_when_size_equals_slide() {
        let assigner = SlidingWindowAssigner::new(10, 10).unwrap();
        assert_eq!(assigner.assign(27).unwrap(), vec![TimeWindow::new(20, 30)]);
    }

    #[test]
    fn test_rejects_timestamps_whose_window_end_overflows() {
        let assigner = SlidingWindowAssigner::new(30, 5).unwrap();
        assert!(assigner.assign(Timestamp::MAX).is_err());
        assert!(assigner.assign(Timestamp::MAX - 1).is_err());

        let last = (Timestamp::MAX - 30) / 5 * 5;
        let windows = assigner.assign(last).unwrap();
        assert_eq!(windows[0], TimeWindow::new(last, last + 30));
        assert_eq!(windows.len(), 6);
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(SlidingWindowAssigner::new(30, 7).is_err());
        assert!(SlidingWindowAssigner::new(30, 0).is_err());
        assert!(SlidingWindowAssigner::new(0, 5).is_err());
        assert!(assign(3, 30, 4).is_err());
        assert_eq!(assign(3, 30, 5).unwrap(), vec![0]);
    }
}
