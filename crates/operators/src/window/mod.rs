//! Sliding windows ranked by key count.

mod aggregator;
mod assigner;
mod lifecycle;
mod sliding_topk;
mod topk;

pub use aggregator::{ApplyOutcome, WindowAggregator, WindowState};
pub use assigner::{assign, SlidingWindowAssigner};
pub use lifecycle::{RankingSink, WindowLifecycle, WindowPhase};
pub use sliding_topk::SlidingTopKOperator;
pub use topk::rank;
