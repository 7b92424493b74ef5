//! In-memory aggregation cache.
//!
//! The cache holds a bounded mapping from metric name to accumulated points
//! and a prioritized drain queue, all owned by a single worker task. The
//! worker multiplexes four activities over one `select!`: ingest from the
//! receivers, drain to the persister, carbonlink-style point lookups, and a
//! periodic checkpoint that resorts the drain queue and emits
//! self-monitoring metrics. There is no lock around the metric map; the
//! channels are the only shared objects.

mod worker;

use crate::core::error::{CinderError, Result};
use crate::core::types::Points;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use worker::Worker;

/// Capacity and sizing knobs for the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Soft cap on the total buffered sample count; 0 disables the limit.
    pub max_size: usize,
    /// Prefix for self-monitoring metric names.
    pub graph_prefix: String,
    /// Input channel buffer (from receivers).
    pub input_capacity: usize,
    /// Output channel buffer (to the persister).
    pub output_capacity: usize,
    /// Query channel buffer (from the query adapter).
    pub query_capacity: usize,
    /// Period of the checkpoint pass.
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_size: 1_000_000,
            graph_prefix: "carbon.".to_string(),
            input_capacity: 51200,
            output_capacity: 1024,
            query_capacity: 16,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

impl CacheSettings {
    /// Validates channel sizing; zero capacities cannot be built.
    pub fn validate(&self) -> Result<()> {
        if self.input_capacity == 0 || self.output_capacity == 0 || self.query_capacity == 0 {
            return Err(CinderError::config("cache channel capacities must be greater than 0"));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(CinderError::config("checkpoint_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// A point lookup paired with its single-use reply channel.
#[derive(Debug)]
pub struct CacheQuery {
    /// Metric name to look up.
    pub metric: String,
    /// Reply channel; the worker sends exactly one reply.
    pub reply: oneshot::Sender<Reply>,
}

/// Reply to a [`CacheQuery`]: a deep copy of the buffered points, if any.
#[derive(Debug)]
pub struct Reply {
    /// Buffered points for the queried metric, or `None` when absent.
    pub points: Option<Points>,
}

/// The aggregation cache. Owns the channel plumbing; all state lives in the
/// worker task spawned by [`Cache::start`].
pub struct Cache {
    input_tx: mpsc::Sender<Points>,
    query_tx: mpsc::Sender<CacheQuery>,
    settings: CacheSettings,

    // Worker-side channel ends, consumed by start()/take_output().
    input_rx: Option<mpsc::Receiver<Points>>,
    query_rx: Option<mpsc::Receiver<CacheQuery>>,
    output_tx: Option<mpsc::Sender<Points>>,
    output_rx: Option<mpsc::Receiver<Points>>,

    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Cache {
    /// Builds the cache and its channels. The worker does not run until
    /// [`Cache::start`].
    pub fn new(settings: CacheSettings) -> Self {
        // tokio channels reject a zero capacity.
        let (input_tx, input_rx) = mpsc::channel(settings.input_capacity.max(1));
        let (query_tx, query_rx) = mpsc::channel(settings.query_capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(settings.output_capacity.max(1));

        Cache {
            input_tx,
            query_tx,
            settings,
            input_rx: Some(input_rx),
            query_rx: Some(query_rx),
            output_tx: Some(output_tx),
            output_rx: Some(output_rx),
            shutdown_tx: None,
            worker: None,
        }
    }

    /// Sender for the receivers to feed points into.
    pub fn input(&self) -> mpsc::Sender<Points> {
        self.input_tx.clone()
    }

    /// Clonable query front for the carbonlink adapter.
    pub fn queries(&self) -> QueryHandle {
        QueryHandle {
            tx: self.query_tx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hands out the output end, once. The consumer receives one whole
    /// `Points` per message and must not hand it back.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Points>> {
        self.output_rx.take()
    }

    /// Spawns the worker task. Idempotent; a second call does nothing.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (input_rx, query_rx, output_tx) = match (
            self.input_rx.take(),
            self.query_rx.take(),
            self.output_tx.take(),
        ) {
            (Some(i), Some(q), Some(o)) => (i, q, o),
            _ => return,
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker::new(
            self.settings.clone(),
            self.input_tx.clone(),
            input_rx,
            output_tx,
            query_rx,
            shutdown_rx,
        );
        self.shutdown_tx = Some(shutdown_tx);
        self.worker = Some(tokio::spawn(worker.run()));
    }

    /// Signals the worker and waits for it to finish. Queries already queued
    /// are replied to; pending input is dropped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "cache worker join failed");
            }
        }
    }
}

/// Clonable query adapter: pairs each lookup with a fresh reply channel and
/// reads the reply so the worker is never stranded.
#[derive(Clone)]
pub struct QueryHandle {
    tx: mpsc::Sender<CacheQuery>,
    dropped: Arc<AtomicU64>,
}

impl QueryHandle {
    /// Looks up the buffered points for one metric.
    ///
    /// A full query channel drops the request and counts it, per the
    /// overflow policy; it does not block the caller.
    pub async fn lookup(&self, metric: &str) -> Result<Option<Points>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let query = CacheQuery {
            metric: metric.to_string(),
            reply: reply_tx,
        };
        self.tx.try_send(query).map_err(|e| match e {
            TrySendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                CinderError::ChannelFull("query")
            },
            TrySendError::Closed(_) => CinderError::ChannelClosed("query"),
        })?;

        match reply_rx.await {
            Ok(reply) => Ok(reply.points),
            Err(_) => Err(CinderError::ChannelClosed("query")),
        }
    }

    /// Lookups dropped because the query channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CacheSettings::default();
        assert_eq!(settings.max_size, 1_000_000);
        assert_eq!(settings.graph_prefix, "carbon.");
        assert_eq!(settings.input_capacity, 51200);
        assert_eq!(settings.output_capacity, 1024);
        assert_eq!(settings.query_capacity, 16);
        assert_eq!(settings.checkpoint_interval, Duration::from_secs(60));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = CacheSettings::default();
        settings.input_capacity = 0;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.checkpoint_interval = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn test_lookup_after_stop_fails() {
        let mut cache = Cache::new(CacheSettings::default());
        cache.start();
        let queries = cache.queries();

        assert_eq!(queries.lookup("missing").await.unwrap(), None);

        cache.stop().await;
        assert!(queries.lookup("missing").await.is_err());
    }
}
