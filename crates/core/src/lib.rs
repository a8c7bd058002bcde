//! Core types shared across the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

mod config;

pub use config::{DrainPolicy, OverflowPolicy, TopKConfig};

/// Logical event time. Milliseconds in the bundled job, but any monotonic unit works.
pub type Timestamp = u64;

/// Messages flowing through operator edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamMessage<T> {
    Data(T),
    /// Event-time watermark.
    Watermark(Timestamp),
    /// End of stream (for bounded inputs / controlled shutdown).
    End,
}

/// A raw record as delivered by a source: opaque bytes plus an arrival timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(timestamp: Timestamp, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }
}

/// A keyed event produced by a key extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<K, V> {
    pub ts: Timestamp,
    pub key: K,
    pub value: V,
}

impl<K, V> Event<K, V> {
    pub fn new(ts: Timestamp, key: K, value: V) -> Self {
        Self { ts, key, value }
    }
}

/// The event type consumed by the ranking operators.
pub type KeyedEvent = Event<String, Bytes>;

/// Half-open event-time interval `[start, end)`.
///
/// Ordering is by `start` first, so a `BTreeMap<TimeWindow, _>` iterates
/// windows in the order they close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> Timestamp {
        self.end - self.start
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

/// One entry of a ranking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

impl KeyCount {
    pub fn new(key: impl Into<String>, count: u64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

/// Keys ordered by descending count, ties by ascending key. At most K entries.
pub type TopKResult = Vec<KeyCount>;

/// The ranking emitted when a window closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedWindow {
    pub window: TimeWindow,
    pub ranking: TopKResult,
}

impl RankedWindow {
    pub fn new(window: TimeWindow, ranking: TopKResult) -> Self {
        Self { window, ranking }
    }
}
