//! Persister adapter: drains the cache output channel into a sink.
//!
//! The cache assumes nothing about how long a write takes; backpressure is
//! applied naturally because the next batch is not received until the sink
//! returns. Durable whisper-style I/O lives behind [`PointsSink`] and is
//! out of scope here.

use crate::core::error::Result;
use crate::core::types::Points;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Destination for drained points.
#[async_trait::async_trait]
pub trait PointsSink: Send + Sync + 'static {
    /// Accepts one whole metric's buffered samples, all at once.
    async fn write(&self, points: &Points) -> Result<()>;
}

/// Sink that counts and logs at debug level.
#[derive(Debug, Default)]
pub struct LogSink {
    metrics: AtomicU64,
    samples: AtomicU64,
}

impl LogSink {
    /// Batches written so far.
    pub fn metrics(&self) -> u64 {
        self.metrics.load(Ordering::Relaxed)
    }

    /// Samples written so far.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl PointsSink for LogSink {
    async fn write(&self, points: &Points) -> Result<()> {
        self.metrics.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(points.len() as u64, Ordering::Relaxed);
        tracing::debug!(metric = %points.metric, samples = points.len(), "persisting points");
        Ok(())
    }
}

/// The persister task. Runs until the cache output channel closes.
pub struct Persister {
    task: JoinHandle<()>,
}

impl Persister {
    /// Spawns the drain loop. A failed write drops that batch and keeps
    /// draining.
    pub fn spawn(mut output: mpsc::Receiver<Points>, sink: Arc<dyn PointsSink>) -> Self {
        let task = tokio::spawn(async move {
            while let Some(points) = output.recv().await {
                if let Err(e) = sink.write(&points).await {
                    tracing::warn!(
                        metric = %points.metric,
                        error = %e,
                        "sink write failed, dropping batch"
                    );
                }
            }
            tracing::info!("persister stopped");
        });
        Persister { task }
    }

    /// Waits for the drain loop to finish.
    pub async fn stop(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "persister join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drains_until_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let sink = Arc::new(LogSink::default());
        let persister = Persister::spawn(rx, Arc::clone(&sink) as Arc<dyn PointsSink>);

        tx.send(Points::one_point("a", 1.0, 10)).await.unwrap();
        tx.send(Points::one_point("b", 2.0, 20).append(30, 3.0))
            .await
            .unwrap();
        drop(tx);
        persister.stop().await;

        assert_eq!(sink.metrics(), 2);
        assert_eq!(sink.samples(), 3);
    }
}
