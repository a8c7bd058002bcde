//! Operators for sliding-window top-K ranking.
//!
//! ## Extraction
//! - [`KeyExtractOperator`] - Turn raw records into keyed events
//! - [`ReferrerExtractor`], [`TimestampedLineExtractor`] - Built-in extractors
//!
//! ## Windows
//! - [`SlidingWindowAssigner`] - Timestamp to window assignment
//! - [`WindowAggregator`] - Per-window key counts and the partition watermark
//! - [`WindowLifecycle`] - Closing, ranking, emission and cleanup
//! - [`SlidingTopKOperator`] - The above as a runtime operator
//!
//! ## Partitions
//! - [`RankingMerger`] - Global ranking from per-partition rankings

pub mod extract;
pub mod merge;
pub mod metrics;
pub mod watermark;
pub mod window;

pub use extract::{KeyExtractOperator, KeyExtractor, ReferrerExtractor, TimestampedLineExtractor};
pub use merge::{spawn_merger, RankingMerger};
pub use metrics::{shared_metrics, SharedMetrics, WindowMetrics};
pub use watermark::{GlobalWatermark, WatermarkTracker};
pub use window::{
    assign, rank, ApplyOutcome, RankingSink, SlidingTopKOperator, SlidingWindowAssigner,
    WindowAggregator, WindowLifecycle, WindowPhase, WindowState,
};
