//! Top referrers over sliding windows.
//!
//! Reads one record per stdin line, keys it by referring site, and prints the
//! K most frequent referrers of every sliding window as it closes.
//!
//! Flow:
//!   stdin -> key extraction -> router -> N x sliding top-k -> merger -> stdout
//!
//! # Usage
//!
//! ```bash
//! # "<event-time-ms> <referrer>" per line, 30 minute windows every 5 seconds
//! cat clicks.log | top-referrer --k 3
//!
//! # Stamp records with arrival time instead
//! tail -f referrers.log | top-referrer --arrival-time --partitions 4
//! ```

mod sink;
mod source;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::sync::mpsc;
use toprank_core::{DrainPolicy, KeyedEvent, OverflowPolicy, RawRecord, RankedWindow, TopKConfig};
use toprank_operators::{
    shared_metrics, spawn_merger, KeyExtractOperator, KeyExtractor, RankingMerger,
    ReferrerExtractor, SlidingTopKOperator, TimestampedLineExtractor, WindowMetrics,
};
use toprank_runtime::{
    spawn_fan_in, spawn_operator, spawn_router, spawn_sink, spawn_source, stream_channel,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Drain {
    Flush,
    Discard,
}

#[derive(Debug, Parser)]
#[command(name = "top-referrer")]
struct Args {
    /// JSON file with a full configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Window size in milliseconds.
    #[arg(long)]
    window_size: Option<u64>,

    /// Slide interval in milliseconds.
    #[arg(long)]
    slide: Option<u64>,

    /// Number of referrers ranked per window.
    #[arg(long)]
    k: Option<usize>,

    /// How far the watermark trails the newest event, in milliseconds.
    #[arg(long)]
    allowed_lateness: Option<u64>,

    /// Cap on distinct referrers tracked per window.
    #[arg(long)]
    max_keys: Option<usize>,

    /// Fail instead of evicting when a window exceeds --max-keys.
    #[arg(long)]
    strict: bool,

    /// What to do with open windows on shutdown.
    #[arg(long, value_enum)]
    drain: Option<Drain>,

    /// Stamp records with arrival time instead of reading it from the line.
    #[arg(long)]
    arrival_time: bool,

    /// Number of parallel window partitions.
    #[arg(long, default_value_t = 1)]
    partitions: usize,

    /// Bounded channel capacity between tasks.
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,

    /// Print rankings as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn topk_config(&self) -> Result<TopKConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid configuration in {}", path.display()))?
            }
            None => TopKConfig::default(),
        };

        if let Some(size) = self.window_size {
            config.window_size = size;
        }
        if let Some(slide) = self.slide {
            config.slide_interval = slide;
        }
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(lateness) = self.allowed_lateness {
            config.allowed_lateness = lateness;
        }
        if let Some(max_keys) = self.max_keys {
            config.max_distinct_keys_per_window = Some(max_keys);
        }
        if self.strict {
            config.overflow_policy = OverflowPolicy::Strict;
        }
        if let Some(drain) = self.drain {
            config.drain_policy = match drain {
                Drain::Flush => DrainPolicy::Flush,
                Drain::Discard => DrainPolicy::Discard,
            };
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.topk_config()?;
    anyhow::ensure!(args.partitions > 0, "partitions must be greater than 0");

    info!(
        window_size = config.window_size,
        slide = config.slide_interval,
        k = config.k,
        allowed_lateness = config.allowed_lateness,
        partitions = args.partitions,
        "starting top-referrer"
    );

    let extract_metrics = shared_metrics();
    let partition_metrics: Vec<_> = (0..args.partitions).map(|_| shared_metrics()).collect();

    let (src_tx, src_rx) = stream_channel::<RawRecord>(args.channel_capacity);
    let (ev_tx, ev_rx) = stream_channel::<KeyedEvent>(args.channel_capacity);

    let arrival_time = args.arrival_time;
    spawn_source("stdin", src_tx, move |out| source::read_stdin(out, arrival_time));

    let extractor: Box<dyn KeyExtractor> = if arrival_time {
        Box::new(ReferrerExtractor)
    } else {
        Box::new(TimestampedLineExtractor::new(ReferrerExtractor))
    };
    spawn_operator(
        "extract",
        KeyExtractOperator::new(
            move |record: &RawRecord| extractor.extract(record),
            config.allowed_lateness,
        )
        .with_metrics(extract_metrics.clone()),
        src_rx,
        ev_tx,
    );

    let mut partition_inputs = Vec::with_capacity(args.partitions);
    let mut partition_outputs = Vec::with_capacity(args.partitions);
    for metrics in &partition_metrics {
        let (in_tx, in_rx) = stream_channel::<KeyedEvent>(args.channel_capacity);
        let (out_tx, out_rx) = stream_channel::<RankedWindow>(args.channel_capacity);
        let op = SlidingTopKOperator::new(&config)?.with_metrics(metrics.clone());
        spawn_operator("sliding_topk", op, in_rx, out_tx);
        partition_inputs.push(in_tx);
        partition_outputs.push(out_rx);
    }
    spawn_router("router", ev_rx, partition_inputs, |ev: &KeyedEvent| ev.key.as_str());

    let (fan_tx, fan_rx) = mpsc::channel(args.channel_capacity);
    spawn_fan_in("fan_in", partition_outputs, fan_tx);

    let (res_tx, res_rx) = stream_channel::<RankedWindow>(args.channel_capacity);
    spawn_merger("merger", RankingMerger::new(args.partitions, config.k), fan_rx, res_tx);

    spawn_sink("console", res_rx, sink::console_sink(args.json))
        .await
        .context("console sink panicked")?;

    let mut total: WindowMetrics = extract_metrics.read().clone();
    for metrics in &partition_metrics {
        total += &*metrics.read();
    }
    info!(
        events = total.events_applied,
        malformed = total.malformed_records,
        late = total.late_events,
        evicted_keys = total.evicted_keys,
        windows = total.windows_emitted,
        dropped_results = total.dropped_results,
        "top-referrer finished"
    );
    Ok(())
}
