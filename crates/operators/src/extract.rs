//! Key extraction from raw records.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use toprank_core::{KeyedEvent, RawRecord, StreamMessage, Timestamp};
use toprank_runtime::{Emitter, Operator};
use tracing::{debug, info};

use crate::metrics::SharedMetrics;
use crate::watermark::WatermarkTracker;

/// Maps a raw record to a keyed event, or rejects it as malformed.
pub trait KeyExtractor: Send + 'static {
    fn extract(&self, record: &RawRecord) -> Result<KeyedEvent>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RawRecord) -> Result<KeyedEvent> + Send + 'static,
{
    fn extract(&self, record: &RawRecord) -> Result<KeyedEvent> {
        self(record)
    }
}

/// Keys a record by the referring site in its UTF-8 payload.
///
/// `https://www.Example.com/a?b` and `example.com/a` both key as `example.com`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferrerExtractor;

impl ReferrerExtractor {
    /// Normalized host of a referrer URL or bare host token.
    pub fn referrer(text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || text.chars().any(char::is_whitespace) {
            return None;
        }
        let rest = match text.split_once("://") {
            Some(("", _)) => return None,
            Some((_, rest)) => rest,
            None => text,
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        let host = host_port.split(':').next().unwrap_or_default().to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        (!host.is_empty()).then(|| host.to_string())
    }
}

impl KeyExtractor for ReferrerExtractor {
    fn extract(&self, record: &RawRecord) -> Result<KeyedEvent> {
        let text = std::str::from_utf8(&record.payload).context("payload is not UTF-8")?;
        let key = Self::referrer(text).ok_or_else(|| anyhow!("no referrer in {:?}", text))?;
        Ok(KeyedEvent::new(record.timestamp, key, record.payload.clone()))
    }
}

/// Reads the event time from the payload itself: `"<timestamp> <rest>"`.
///
/// The rest of the payload is handed to the inner extractor with the parsed
/// timestamp replacing the arrival time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampedLineExtractor<E> {
    inner: E,
}

impl<E: KeyExtractor> TimestampedLineExtractor<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: KeyExtractor> KeyExtractor for TimestampedLineExtractor<E> {
    fn extract(&self, record: &RawRecord) -> Result<KeyedEvent> {
        let line = std::str::from_utf8(&record.payload).context("payload is not UTF-8")?;
        let Some((ts, rest)) = line.trim_start().split_once(char::is_whitespace) else {
            bail!("expected '<timestamp> <payload>', got {:?}", line);
        };
        let timestamp: Timestamp = ts
            .parse()
            .with_context(|| format!("invalid timestamp {:?}", ts))?;
        let offset = line.len() - rest.len();
        self.inner
            .extract(&RawRecord::new(timestamp, record.payload.slice(offset..)))
    }
}

/// Applies a [`KeyExtractor`] to every record.
///
/// Malformed records are dropped and counted. Emits a bounded-lateness
/// watermark whenever the largest seen timestamp moves it forward, so that
/// partitions receiving no events still make progress.
pub struct KeyExtractOperator<E> {
    extractor: E,
    watermark: WatermarkTracker,
    malformed: u64,
    shared: Option<SharedMetrics>,
}

impl<E: KeyExtractor> KeyExtractOperator<E> {
    pub fn new(extractor: E, allowed_lateness: Timestamp) -> Self {
        Self {
            extractor,
            watermark: WatermarkTracker::new(allowed_lateness),
            malformed: 0,
            shared: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.shared = Some(metrics);
        self
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

#[async_trait]
impl<E: KeyExtractor> Operator for KeyExtractOperator<E> {
    type In = RawRecord;
    type Out = KeyedEvent;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Self::In>,
        out: &mut Emitter<Self::Out>,
    ) -> Result<()> {
        match msg {
            StreamMessage::Data(record) => {
                let extracted = self.extractor.extract(&record);
                match extracted {
                    Ok(event) => {
                        let ts = event.ts;
                        out.data(event).await?;
                        if self.watermark.observe(ts) {
                            out.watermark(self.watermark.current()).await?;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.malformed += 1;
                        if let Some(shared) = &self.shared {
                            shared.write().malformed_records += 1;
                        }
                        debug!(error = %e, "dropping malformed record");
                        Ok(())
                    }
                }
            }
            StreamMessage::Watermark(wm) => {
                if self.watermark.advance_to(wm) {
                    out.watermark(wm).await?;
                }
                Ok(())
            }
            StreamMessage::End => out.end().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        info!(malformed = self.malformed, "key extraction finished");
        Ok(())
    }
}
