//! Line-oriented stdin source.

use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use toprank_core::{RawRecord, Timestamp};
use toprank_runtime::Emitter;
use tracing::info;

/// Emit every stdin line as a record until EOF or Ctrl-C, then End.
///
/// With `arrival_time` the record is stamped with the wall clock in
/// milliseconds; otherwise the stamp is 0 and the extractor reads the event
/// time from the line.
pub async fn read_stdin(mut out: Emitter<RawRecord>, arrival_time: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let ts = if arrival_time { now_ms() } else { 0 };
                out.data(RawRecord::new(ts, line)).await?;
                count += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, draining");
                break;
            }
        }
    }

    info!(records = count, "input finished");
    out.end().await
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}
