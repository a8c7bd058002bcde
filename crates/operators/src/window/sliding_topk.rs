//! Sliding window top-K operator.

use anyhow::Result;
use async_trait::async_trait;
use toprank_core::{KeyedEvent, RankedWindow, StreamMessage, Timestamp, TopKConfig};
use toprank_runtime::{Emitter, Operator};
use tracing::info;

use super::WindowLifecycle;
use crate::metrics::SharedMetrics;

/// Keyed sliding-window top-K over event time.
///
/// Input: KeyedEvent
/// Output: RankedWindow
///
/// The watermark trails the largest event timestamp by the allowed lateness
/// and also follows upstream watermarks. Whenever it advances, closed windows
/// are ranked and emitted in start order, followed by the new watermark.
///
/// Each ranking gets `max_emit_attempts` deliveries before it is abandoned
/// and counted as a dropped result. A closed downstream channel fails every
/// attempt, so all pending rankings are abandoned and the operator stops
/// with an error.
///
/// # Example
///
/// ```ignore
/// // 30-minute windows every 5 seconds, top 3 keys
/// let op = SlidingTopKOperator::new(&TopKConfig::sliding(1_800_000, 5_000, 3))?;
/// ```
pub struct SlidingTopKOperator {
    lifecycle: WindowLifecycle,
    forwarded_wm: Timestamp,
    shared: Option<SharedMetrics>,
}

impl SlidingTopKOperator {
    /// Create the operator. Fails on an invalid configuration.
    pub fn new(config: &TopKConfig) -> Result<Self> {
        Ok(Self {
            lifecycle: WindowLifecycle::new(config)?,
            forwarded_wm: 0,
            shared: None,
        })
    }

    /// Publish metrics to `metrics` after every message.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.shared = Some(metrics);
        self
    }

    async fn emit_closed(&mut self, out: &mut Emitter<RankedWindow>) -> Result<()> {
        self.lifecycle.deliver_pending(out).await?;
        let wm = self.lifecycle.watermark();
        if wm > self.forwarded_wm {
            self.forwarded_wm = wm;
            out.watermark(wm).await?;
        }
        Ok(())
    }

    fn publish_metrics(&self) {
        if let Some(shared) = &self.shared {
            *shared.write() = self.lifecycle.metrics().clone();
        }
    }
}

#[async_trait]
impl Operator for SlidingTopKOperator {
    type In = KeyedEvent;
    type Out = RankedWindow;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Self::In>,
        out: &mut Emitter<Self::Out>,
    ) -> Result<()> {
        let result = match msg {
            StreamMessage::Data(ev) => {
                self.lifecycle.on_event(&ev)?;
                self.emit_closed(out).await
            }
            StreamMessage::Watermark(wm) => {
                self.lifecycle.on_watermark(wm);
                self.emit_closed(out).await
            }
            StreamMessage::End => match self.lifecycle.drain(out).await {
                Ok(()) => out.end().await,
                Err(e) => Err(e),
            },
        };
        self.publish_metrics();
        result
    }

    async fn close(&mut self) -> Result<()> {
        let m = self.lifecycle.metrics();
        info!(
            emitted = m.windows_emitted,
            late_events = m.late_events,
            evicted_keys = m.evicted_keys,
            forced_closes = m.forced_closes,
            dropped_results = m.dropped_results,
            open_windows = self.lifecycle.open_windows(),
            "sliding top-k finished"
        );
        Ok(())
    }
}
