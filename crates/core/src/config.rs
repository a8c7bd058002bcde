//! Sliding top-K configuration.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// What to do when a window exceeds `max_distinct_keys_per_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the least recently updated key of the window.
    #[default]
    Evict,
    /// Fail the operator.
    Strict,
}

/// What happens to open windows on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Force-close every open window and emit its partial ranking.
    #[default]
    Flush,
    /// Drop open windows without emitting.
    Discard,
}

/// Configuration for sliding-window top-K ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopKConfig {
    /// Window size (W), in logical time units.
    pub window_size: Timestamp,
    /// Slide interval (S). `window_size` must be a multiple of it.
    pub slide_interval: Timestamp,
    /// Number of keys ranked per window.
    pub k: usize,
    /// How far the watermark trails the maximum observed timestamp.
    pub allowed_lateness: Timestamp,
    /// Optional cap on distinct keys tracked per window.
    pub max_distinct_keys_per_window: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    /// Cap on simultaneously open windows. Derived from W, S and lateness when unset.
    pub max_open_windows: Option<usize>,
    pub drain_policy: DrainPolicy,
    /// Emission attempts per window before its result is abandoned.
    pub max_emit_attempts: u32,
    /// How long (in watermark time) a closed window is retained for late-event diagnostics.
    pub closed_retention: Timestamp,
}

impl Default for TopKConfig {
    fn default() -> Self {
        Self {
            window_size: 30 * 60 * 1000,
            slide_interval: 5 * 1000,
            k: 3,
            allowed_lateness: 0,
            max_distinct_keys_per_window: None,
            overflow_policy: OverflowPolicy::Evict,
            max_open_windows: None,
            drain_policy: DrainPolicy::Flush,
            max_emit_attempts: 3,
            closed_retention: 0,
        }
    }
}

impl TopKConfig {
    /// Sliding windows of `window_size`, advancing every `slide_interval`, ranking `k` keys.
    pub fn sliding(window_size: Timestamp, slide_interval: Timestamp, k: usize) -> Self {
        Self {
            window_size,
            slide_interval,
            k,
            ..Default::default()
        }
    }

    pub fn with_allowed_lateness(mut self, lateness: Timestamp) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    pub fn with_max_keys(mut self, max_keys: usize, policy: OverflowPolicy) -> Self {
        self.max_distinct_keys_per_window = Some(max_keys);
        self.overflow_policy = policy;
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_closed_retention(mut self, retention: Timestamp) -> Self {
        self.closed_retention = retention;
        self
    }

    /// Reject configurations that would produce wrong windows.
    pub fn validate(&self) -> Result<()> {
        if self.slide_interval == 0 {
            bail!("slide interval must be greater than 0");
        }
        if self.window_size == 0 {
            bail!("window size must be greater than 0");
        }
        if self.window_size % self.slide_interval != 0 {
            bail!(
                "window size {} is not a multiple of slide interval {}",
                self.window_size,
                self.slide_interval
            );
        }
        if self.k == 0 {
            bail!("k must be greater than 0");
        }
        if self.max_distinct_keys_per_window == Some(0) {
            bail!("max distinct keys per window must be greater than 0");
        }
        if self.max_open_windows == Some(0) {
            bail!("max open windows must be greater than 0");
        }
        if self.max_emit_attempts == 0 {
            bail!("max emit attempts must be greater than 0");
        }
        Ok(())
    }

    /// Number of windows each event belongs to (W / S).
    pub fn windows_per_event(&self) -> usize {
        (self.window_size / self.slide_interval) as usize
    }

    /// Effective cap on open windows.
    ///
    /// Open windows satisfy `start <= max_ts` and `end > max_ts - lateness`,
    /// which bounds them by `W/S + ceil(lateness/S) + 1`.
    pub fn open_window_limit(&self) -> usize {
        self.max_open_windows.unwrap_or_else(|| {
            let late_windows = self.allowed_lateness.div_ceil(self.slide_interval) as usize;
            self.windows_per_event() + late_windows + 1
        })
    }
}
