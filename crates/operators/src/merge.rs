//! Merging per-partition rankings into a global ranking.
//!
//! Keys are partitioned by hash, so every key lives in exactly one partition
//! and any globally top-ranked key is also in its partition's top K. Ranking
//! the union of the partition results is therefore exact. A window is merged
//! once the global watermark (minimum over partitions) passes its end.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use toprank_core::{RankedWindow, StreamMessage, TimeWindow, Timestamp};
use toprank_runtime::{Emitter, PartitionMessage, Sender};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::watermark::GlobalWatermark;
use crate::window::rank;

pub struct RankingMerger {
    k: usize,
    global: GlobalWatermark,
    pending: BTreeMap<TimeWindow, HashMap<String, u64>>,
}

impl RankingMerger {
    pub fn new(partitions: usize, k: usize) -> Self {
        Self {
            k,
            global: GlobalWatermark::new(partitions),
            pending: BTreeMap::new(),
        }
    }

    pub fn watermark(&self) -> Timestamp {
        self.global.current()
    }

    /// Windows waiting for the global watermark.
    pub fn pending_windows(&self) -> usize {
        self.pending.len()
    }

    /// Handle one tagged message. Returns true once every partition has ended.
    pub async fn on_message(
        &mut self,
        tagged: PartitionMessage<RankedWindow>,
        out: &mut Emitter<RankedWindow>,
    ) -> Result<bool> {
        let PartitionMessage { partition, msg } = tagged;
        match msg {
            StreamMessage::Data(ranked) => {
                let window = ranked.window;
                let merged = self.pending.entry(window).or_default();
                for entry in ranked.ranking {
                    *merged.entry(entry.key).or_insert(0) += entry.count;
                }
                let global = self.global.current();
                if window.end <= global {
                    warn!(%window, partition, "ranking arrived after global watermark");
                    self.flush_through(global, out).await?;
                }
                Ok(false)
            }
            StreamMessage::Watermark(wm) => {
                if let Some(global) = self.global.update(partition, wm) {
                    self.flush_through(global, out).await?;
                    out.watermark(global).await?;
                }
                Ok(false)
            }
            StreamMessage::End => {
                debug!(partition, "partition finished");
                if let Some(global) = self.global.finish(partition) {
                    self.flush_through(global, out).await?;
                }
                if self.global.all_finished() {
                    out.end().await?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    async fn flush_through(
        &mut self,
        wm: Timestamp,
        out: &mut Emitter<RankedWindow>,
    ) -> Result<()> {
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().end > wm {
                break;
            }
            let window = *entry.key();
            let counts = entry.remove();
            let ranking = rank(&counts, self.k);
            if !ranking.is_empty() {
                out.data(RankedWindow::new(window, ranking)).await?;
            }
        }
        Ok(())
    }
}

/// Spawn the merger over a tagged fan-in channel.
pub fn spawn_merger(
    name: &'static str,
    mut merger: RankingMerger,
    mut rx: mpsc::Receiver<PartitionMessage<RankedWindow>>,
    tx: Sender<RankedWindow>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut out = Emitter::new(tx);
        debug!(%name, "merger started");
        while let Some(tagged) = rx.recv().await {
            match merger.on_message(tagged, &mut out).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!(%name, error = %e, "merger error");
                    let _ = out.end().await;
                    break;
                }
            }
        }
        debug!(%name, emitted = out.emitted(), "merger stopped");
    })
}
