//! Console output for rankings.

use anyhow::Result;
use std::io::Write;
use toprank_core::{RankedWindow, StreamMessage};
use tracing::{debug, info};

/// Write one ranking as `key: count` lines under a window header.
pub fn write_ranking<W: Write>(w: &mut W, ranked: &RankedWindow) -> std::io::Result<()> {
    writeln!(w, "window {}", ranked.window)?;
    for entry in &ranked.ranking {
        writeln!(w, "{}: {}", entry.key, entry.count)?;
    }
    writeln!(w)
}

/// Sink handler printing rankings as text or JSON lines.
pub fn console_sink(json: bool) -> impl FnMut(StreamMessage<RankedWindow>) -> Result<()> {
    move |msg| {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        match msg {
            StreamMessage::Data(ranked) => {
                if json {
                    serde_json::to_writer(&mut out, &ranked)?;
                    writeln!(out)?;
                } else {
                    write_ranking(&mut out, &ranked)?;
                }
                out.flush()?;
            }
            StreamMessage::Watermark(wm) => debug!(watermark = wm, "watermark advanced"),
            StreamMessage::End => info!("stream ended"),
        }
        Ok(())
    }
}
