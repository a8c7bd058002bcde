//! Key partitioning between parallel operator instances.
//!
//! Data records are routed by a hash of their key so each key is owned by
//! exactly one partition. Watermarks and End are broadcast to every partition.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use toprank_core::StreamMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::{Receiver, Sender};

/// A message tagged with the partition it came from.
#[derive(Debug, Clone)]
pub struct PartitionMessage<T> {
    pub partition: usize,
    pub msg: StreamMessage<T>,
}

/// Stable partition index for a key.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Spawn a router fanning one stream out to `outs` by key.
///
/// With no outputs the router logs an error and stops at once, closing its input.
pub fn spawn_router<T, F>(
    name: &'static str,
    mut rx: Receiver<T>,
    outs: Vec<Sender<T>>,
    key_fn: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: for<'a> Fn(&'a T) -> &'a str + Send + 'static,
{
    tokio::spawn(async move {
        if outs.is_empty() {
            error!(%name, "router has no partitions");
            return;
        }
        debug!(%name, partitions = outs.len(), "router started");
        while let Some(msg) = rx.recv().await {
            match msg {
                StreamMessage::Data(item) => {
                    let partition = partition_for(key_fn(&item), outs.len());
                    if outs[partition].send(StreamMessage::Data(item)).await.is_err() {
                        error!(%name, partition, "partition channel closed");
                        return;
                    }
                }
                StreamMessage::Watermark(wm) => {
                    for (partition, out) in outs.iter().enumerate() {
                        if out.send(StreamMessage::Watermark(wm)).await.is_err() {
                            error!(%name, partition, "partition channel closed");
                            return;
                        }
                    }
                }
                StreamMessage::End => break,
            }
        }
        for out in &outs {
            let _ = out.send(StreamMessage::End).await;
        }
        debug!(%name, "router stopped");
    })
}

/// Spawn one forwarding task per input, tagging every message with its partition.
pub fn spawn_fan_in<T>(
    name: &'static str,
    inputs: Vec<Receiver<T>>,
    tx: mpsc::Sender<PartitionMessage<T>>,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
{
    inputs
        .into_iter()
        .enumerate()
        .map(|(partition, mut rx)| {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let is_end = matches!(msg, StreamMessage::End);
                    if tx.send(PartitionMessage { partition, msg }).await.is_err() {
                        error!(%name, partition, "fan-in channel closed");
                        return;
                    }
                    if is_end {
                        break;
                    }
                }
                debug!(%name, partition, "fan-in input drained");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_channel;

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        for key in ["a", "b", "example.com", ""] {
            let p = partition_for(key, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(key, 4));
        }
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_router_sends_key_to_one_partition_and_broadcasts_watermarks() {
        let (in_tx, in_rx) = stream_channel::<String>(8);
        let (a_tx, mut a_rx) = stream_channel(8);
        let (b_tx, mut b_rx) = stream_channel(8);
        let handle = spawn_router("router", in_rx, vec![a_tx, b_tx], |s: &String| s.as_str());

        in_tx.send(StreamMessage::Data("k".to_string())).await.unwrap();
        in_tx.send(StreamMessage::Watermark(7)).await.unwrap();
        in_tx.send(StreamMessage::End).await.unwrap();
        handle.await.unwrap();

        let owner = partition_for("k", 2);
        let (owner_rx, other_rx) = if owner == 0 {
            (&mut a_rx, &mut b_rx)
        } else {
            (&mut b_rx, &mut a_rx)
        };
        assert!(matches!(owner_rx.recv().await, Some(StreamMessage::Data(ref k)) if k == "k"));
        assert!(matches!(owner_rx.recv().await, Some(StreamMessage::Watermark(7))));
        assert!(matches!(owner_rx.recv().await, Some(StreamMessage::End)));
        assert!(matches!(other_rx.recv().await, Some(StreamMessage::Watermark(7))));
        assert!(matches!(other_rx.recv().await, Some(StreamMessage::End)));
    }

    #[tokio::test]
    async fn test_router_without_partitions_stops() {
        let (in_tx, in_rx) = stream_channel::<String>(8);
        let handle = spawn_router("router", in_rx, Vec::new(), |s: &String| s.as_str());
        handle.await.unwrap();

        assert!(in_tx.is_closed());
        assert!(in_tx.send(StreamMessage::Data("k".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_fan_in_tags_partition() {
        let (a_tx, a_rx) = stream_channel::<u8>(4);
        let (b_tx, b_rx) = stream_channel::<u8>(4);
        let (tx, mut rx) = mpsc::channel(8);
        let handles = spawn_fan_in("fan-in", vec![a_rx, b_rx], tx);

        b_tx.send(StreamMessage::Data(9)).await.unwrap();
        b_tx.send(StreamMessage::End).await.unwrap();
        a_tx.send(StreamMessage::End).await.unwrap();
        for h in handles {
            h.await.unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(m) = rx.try_recv() {
            seen.push((m.partition, matches!(m.msg, StreamMessage::Data(9))));
        }
        assert!(seen.contains(&(1, true)));
        assert_eq!(seen.len(), 3);
    }
}
