//! Minimal runtime for a streaming operator chain.
//!
//! - single-input, single-output operators
//! - bounded channels (backpressure)
//! - watermarks and End are propagated
//! - key-partitioned fan-out and tagged fan-in for parallel operator instances

use anyhow::Result;
use async_trait::async_trait;
use toprank_core::{StreamMessage, Timestamp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

mod partition;

pub use partition::{partition_for, spawn_fan_in, spawn_router, PartitionMessage};

pub type Sender<T> = mpsc::Sender<StreamMessage<T>>;
pub type Receiver<T> = mpsc::Receiver<StreamMessage<T>>;

/// Outbound collector for an operator.
#[derive(Clone)]
pub struct Emitter<T> {
    tx: Sender<T>,
    emitted: u64,
}

impl<T: Send + 'static> Emitter<T> {
    pub fn new(tx: Sender<T>) -> Self {
        Self { tx, emitted: 0 }
    }

    pub async fn emit(&mut self, msg: StreamMessage<T>) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("downstream channel closed"))
    }

    pub async fn data(&mut self, item: T) -> Result<()> {
        self.emit(StreamMessage::Data(item)).await?;
        self.emitted += 1;
        Ok(())
    }

    pub async fn watermark(&mut self, ts: Timestamp) -> Result<()> {
        self.emit(StreamMessage::Watermark(ts)).await
    }

    pub async fn end(&mut self) -> Result<()> {
        self.emit(StreamMessage::End).await
    }

    /// Number of data records successfully sent downstream.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// An operator transforms an input stream into an output stream.
#[async_trait]
pub trait Operator: Send + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Self::In>,
        out: &mut Emitter<Self::Out>,
    ) -> Result<()>;

    /// Called once the input ends or `on_message` fails, before the task exits.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Create a bounded channel for stream messages.
pub fn stream_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(capacity)
}

/// Spawn an operator as an async task.
pub fn spawn_operator<O>(
    name: &'static str,
    mut op: O,
    mut rx: Receiver<O::In>,
    tx: Sender<O::Out>,
) -> JoinHandle<()>
where
    O: Operator,
{
    tokio::spawn(async move {
        let mut out = Emitter::new(tx);
        let mut metrics = OperatorMetrics::default();
        debug!(%name, "operator started");

        while let Some(msg) = rx.recv().await {
            let is_end = matches!(msg, StreamMessage::End);
            match &msg {
                StreamMessage::Data(_) => metrics.records_in += 1,
                StreamMessage::Watermark(wm) => metrics.watermark = metrics.watermark.max(*wm),
                StreamMessage::End => {}
            }

            if let Err(e) = op.on_message(msg, &mut out).await {
                error!(%name, error = %e, "operator error");
                let _ = out.end().await;
                break;
            }

            if is_end {
                break;
            }
        }

        if let Err(e) = op.close().await {
            error!(%name, error = %e, "operator close failed");
        }

        metrics.records_out = out.emitted();
        debug!(
            %name,
            records_in = metrics.records_in,
            records_out = metrics.records_out,
            watermark = metrics.watermark,
            "operator stopped"
        );
    })
}

/// Spawn a sink: consumes messages and applies a handler.
pub fn spawn_sink<T, F>(name: &'static str, mut rx: Receiver<T>, mut f: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(StreamMessage<T>) -> Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(%name, "sink started");
        while let Some(msg) = rx.recv().await {
            let is_end = matches!(msg, StreamMessage::End);
            if let Err(e) = f(msg) {
                error!(%name, error = %e, "sink handler error");
                break;
            }
            if is_end {
                break;
            }
        }
        debug!(%name, "sink stopped");
    })
}

/// Spawn a source that produces messages.
pub fn spawn_source<T, F, Fut>(name: &'static str, tx: Sender<T>, f: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnOnce(Emitter<T>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        debug!(%name, "source started");
        let emitter = Emitter::new(tx);
        if let Err(e) = f(emitter).await {
            error!(%name, error = %e, "source error");
        }
        debug!(%name, "source stopped");
    })
}

/// Metrics for an operator task.
#[derive(Debug, Default, Clone)]
pub struct OperatorMetrics {
    pub records_in: u64,
    pub records_out: u64,
    pub watermark: Timestamp,
}
