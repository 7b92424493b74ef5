//! The single worker task that owns all cache state.
//!
//! Nothing outside this module reads or writes the metric map, the drain
//! queue, or the counters. Every other component talks to the worker over
//! the channels wired up in [`super::Cache`].

use super::{CacheQuery, CacheSettings, Reply};
use crate::core::types::Points;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Drain queue entry: a metric name and its sample count at the last rebuild.
#[derive(Debug)]
pub(crate) struct QueueItem {
    metric: String,
    count: usize,
}

/// Mutable cache state, owned exclusively by the worker.
pub(crate) struct CacheState {
    settings: CacheSettings,
    data: HashMap<String, Points>,
    queue: Vec<QueueItem>,
    size: usize,
    query_cnt: usize,
    overflow_cnt: usize,
}

impl CacheState {
    pub(crate) fn new(settings: CacheSettings) -> Self {
        CacheState {
            settings,
            data: HashMap::new(),
            queue: Vec::new(),
            size: 0,
            query_cnt: 0,
            overflow_cnt: 0,
        }
    }

    /// Merges points into the map unconditionally.
    fn add(&mut self, points: Points) {
        self.size += points.data.len();
        if let Some(existing) = self.data.get_mut(&points.metric) {
            existing.data.extend(points.data);
        } else {
            self.data.insert(points.metric.clone(), points);
        }
    }

    /// Merges incoming points, or drops them when the cache is full.
    ///
    /// A `max_size` of zero disables the limit. Points with no samples are
    /// discarded: the map never holds an empty entry, so the output never
    /// carries one.
    pub(crate) fn ingest(&mut self, points: Points) {
        if points.data.is_empty() {
            return;
        }
        if self.settings.max_size > 0 && self.size >= self.settings.max_size {
            self.overflow_cnt += 1;
        } else {
            self.add(points);
        }
    }

    /// Removes a metric and returns its points. Absent metrics are a no-op.
    fn remove(&mut self, metric: &str) -> Option<Points> {
        let points = self.data.remove(metric)?;
        self.size -= points.data.len();
        Some(points)
    }

    /// Selects and removes the next metric to drain.
    ///
    /// Pops the queue from the tail (highest count at sort time), skipping
    /// entries whose metric has already left the map. With an exhausted
    /// queue, falls back to an arbitrary entry. Never returns empty points:
    /// the map holds no empty entries.
    pub(crate) fn pop(&mut self) -> Option<Points> {
        while let Some(item) = self.queue.pop() {
            if let Some(points) = self.remove(&item.metric) {
                return Some(points);
            }
        }
        let metric = self.data.keys().next()?.clone();
        self.remove(&metric)
    }

    /// Looks up a metric for a query reply, checking the in-flight candidate
    /// before the live map. The reply carries its own copy of the data.
    pub(crate) fn lookup(&mut self, candidate: Option<&Points>, metric: &str) -> Option<Points> {
        self.query_cnt += 1;
        match candidate {
            Some(c) if c.metric == metric => Some(c.clone()),
            _ => self.data.get(metric).cloned(),
        }
    }

    /// Feeds one self-monitoring sample into the cache and queues it for a
    /// prompt drain.
    fn stat(&mut self, name: &str, value: f64) {
        let metric = format!("{}cache.{}", self.settings.graph_prefix, name);
        self.add(Points::now_point(&metric, value));
        self.queue.push(QueueItem { metric, count: 1 });
    }

    /// Rebuilds the drain queue from the live map, smallest counts first so
    /// that popping from the tail drains the largest accumulations.
    pub(crate) fn rebuild_queue(&mut self) {
        let mut queue: Vec<QueueItem> = self
            .data
            .iter()
            .map(|(metric, points)| QueueItem {
                metric: metric.clone(),
                count: points.data.len(),
            })
            .collect();
        queue.sort_by(|a, b| a.count.cmp(&b.count));
        self.queue = queue;
    }

    /// Emits checkpoint stats and resets the per-period counters.
    pub(crate) fn finish_checkpoint(
        &mut self,
        elapsed: std::time::Duration,
        input_len_before: usize,
        input_len_after: usize,
    ) {
        let size = self.size;
        let metrics = self.data.len();
        let queries = self.query_cnt;
        let overflow = self.overflow_cnt;

        self.stat("size", size as f64);
        self.stat("metrics", metrics as f64);
        self.stat("queries", queries as f64);
        self.stat("overflow", overflow as f64);
        self.stat("checkpointTime", elapsed.as_secs_f64());
        self.stat("inputLenBeforeCheckpoint", input_len_before as f64);
        self.stat("inputLenAfterCheckpoint", input_len_after as f64);

        tracing::info!(
            elapsed = ?elapsed,
            size,
            metrics,
            queries,
            overflow,
            input_len_before,
            input_len_after,
            "cache checkpoint"
        );

        self.query_cnt = 0;
        self.overflow_cnt = 0;
    }
}

pub(crate) struct Worker {
    state: CacheState,
    /// Kept for measuring the input backlog at checkpoint time.
    input_tx: mpsc::Sender<Points>,
    input_rx: mpsc::Receiver<Points>,
    output_tx: mpsc::Sender<Points>,
    query_rx: mpsc::Receiver<CacheQuery>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl Worker {
    pub(crate) fn new(
        settings: CacheSettings,
        input_tx: mpsc::Sender<Points>,
        input_rx: mpsc::Receiver<Points>,
        output_tx: mpsc::Sender<Points>,
        query_rx: mpsc::Receiver<CacheQuery>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        Worker {
            state: CacheState::new(settings),
            input_tx,
            input_rx,
            output_tx,
            query_rx,
            shutdown_rx,
        }
    }

    /// The multiplexing loop. Suspends only at the select; every branch body
    /// is bounded and synchronous.
    pub(crate) async fn run(mut self) {
        let period = self.state.settings.checkpoint_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut candidate: Option<Points> = None;

        loop {
            if candidate.is_none() {
                candidate = self.state.pop();
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let input_len_before = self.input_tx.max_capacity() - self.input_tx.capacity();
                    self.state.rebuild_queue();
                    let input_len_after = self.input_tx.max_capacity() - self.input_tx.capacity();
                    self.state
                        .finish_checkpoint(start.elapsed(), input_len_before, input_len_after);
                },
                Some(query) = self.query_rx.recv() => {
                    let points = self.state.lookup(candidate.as_ref(), &query.metric);
                    // The asker may have given up; a dropped reply end is not an error.
                    let _ = query.reply.send(Reply { points });
                },
                permit = self.output_tx.reserve(), if candidate.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(points) = candidate.take() {
                            permit.send(points);
                        }
                    },
                    Err(_) => {
                        tracing::warn!("output side gone, stopping cache worker");
                        break;
                    },
                },
                Some(points) = self.input_rx.recv() => self.state.ingest(points),
                _ = &mut self.shutdown_rx => {
                    // Reply to queries accepted before the signal, then stop.
                    // Pending input is dropped; the cache is not flushed.
                    while let Ok(query) = self.query_rx.try_recv() {
                        let points = self.state.lookup(candidate.as_ref(), &query.metric);
                        let _ = query.reply.send(Reply { points });
                    }
                    tracing::info!(size = self.state.size, "cache worker stopped");
                    break;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state_with(max_size: usize) -> CacheState {
        CacheState::new(CacheSettings {
            max_size,
            ..CacheSettings::default()
        })
    }

    fn assert_size_invariant(state: &CacheState) {
        let expected: usize = state.data.values().map(|p| p.data.len()).sum();
        assert_eq!(state.size, expected);
        for (metric, points) in &state.data {
            assert_eq!(&points.metric, metric);
            assert!(!points.data.is_empty());
        }
    }

    #[test]
    fn test_ingest_merges_same_metric() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("m", 1.0, 10));
        state.ingest(Points::one_point("m", 2.0, 20));
        state.ingest(Points::one_point("other", 9.0, 30));

        assert_eq!(state.size, 3);
        assert_eq!(state.data.len(), 2);
        assert_eq!(
            state.data.get("m"),
            Some(&Points::one_point("m", 1.0, 10).append(20, 2.0))
        );
        assert_size_invariant(&state);
    }

    #[test]
    fn test_merge_is_associative() {
        let mut one = state_with(0);
        one.ingest(Points::one_point("m", 1.0, 10));
        one.ingest(Points::one_point("m", 2.0, 20));
        one.ingest(Points::one_point("m", 3.0, 30));

        let mut two = state_with(0);
        two.ingest(Points::one_point("m", 1.0, 10).append(20, 2.0));
        two.ingest(Points::one_point("m", 3.0, 30));

        assert_eq!(one.pop(), two.pop());
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let mut state = state_with(2);
        state.ingest(Points::one_point("a", 1.0, 10));
        state.ingest(Points::one_point("b", 2.0, 10));
        state.ingest(Points::one_point("c", 3.0, 10));

        assert_eq!(state.size, 2);
        assert_eq!(state.overflow_cnt, 1);
        assert!(!state.data.contains_key("c"));
        assert_size_invariant(&state);
    }

    #[test]
    fn test_max_size_zero_never_drops() {
        let mut state = state_with(0);
        for i in 0..1000 {
            state.ingest(Points::one_point(&format!("m{}", i), 1.0, i));
        }
        assert_eq!(state.size, 1000);
        assert_eq!(state.overflow_cnt, 0);
    }

    #[test]
    fn test_max_size_one_accepts_only_when_empty() {
        let mut state = state_with(1);
        state.ingest(Points::one_point("a", 1.0, 10));
        state.ingest(Points::one_point("b", 2.0, 10));
        assert_eq!(state.size, 1);
        assert_eq!(state.overflow_cnt, 1);

        assert!(state.pop().is_some());
        state.ingest(Points::one_point("b", 2.0, 10));
        assert_eq!(state.size, 1);
        assert_eq!(state.overflow_cnt, 1);
    }

    #[test]
    fn test_pop_drains_largest_first_after_rebuild() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("a", 0.0, 1));
        for i in 0..5 {
            state.ingest(Points::one_point("b", i as f64, i));
        }
        for i in 0..2 {
            state.ingest(Points::one_point("c", i as f64, i));
        }
        state.rebuild_queue();

        assert_eq!(state.pop().map(|p| p.metric), Some("b".to_string()));
        assert_eq!(state.pop().map(|p| p.metric), Some("c".to_string()));
        assert_eq!(state.pop().map(|p| p.metric), Some("a".to_string()));
        assert_eq!(state.pop(), None);
        assert_eq!(state.size, 0);
    }

    #[test]
    fn test_pop_skips_stale_queue_entries() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("gone", 1.0, 10));
        state.ingest(Points::one_point("kept", 2.0, 20));
        state.rebuild_queue();

        // The metric leaves the map after the rebuild; its queue entry
        // becomes stale and must be skipped.
        state.remove("gone");
        assert_eq!(state.pop().map(|p| p.metric), Some("kept".to_string()));
        assert_eq!(state.pop(), None);
    }

    #[test]
    fn test_pop_falls_back_to_map_when_queue_empty() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("m", 1.0, 10));
        assert!(state.queue.is_empty());
        assert_eq!(state.pop(), Some(Points::one_point("m", 1.0, 10)));
    }

    #[test]
    fn test_ingest_discards_empty_points() {
        let mut state = state_with(0);
        state.ingest(Points {
            metric: "m".to_string(),
            data: Vec::new(),
        });
        assert_eq!(state.size, 0);
        assert!(state.data.is_empty());
        assert_eq!(state.pop(), None);
    }

    #[test]
    fn test_remove_absent_metric_is_noop() {
        let mut state = state_with(0);
        assert!(state.remove("missing").is_none());
        assert_eq!(state.size, 0);
    }

    #[test]
    fn test_lookup_prefers_candidate() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("m", 99.0, 99));
        let candidate = Points::one_point("m", 1.0, 10);

        let reply = state.lookup(Some(&candidate), "m");
        assert_eq!(reply, Some(candidate));
        assert_eq!(state.query_cnt, 1);

        let reply = state.lookup(None, "m");
        assert_eq!(reply, Some(Points::one_point("m", 99.0, 99)));
        assert_eq!(state.query_cnt, 2);

        assert_eq!(state.lookup(None, "missing"), None);
    }

    #[test]
    fn test_lookup_returns_deep_copy() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("m", 1.0, 10));

        let mut copy = state.lookup(None, "m").unwrap();
        copy.data.push(crate::core::types::Point { timestamp: 0, value: 0.0 });

        assert_eq!(state.lookup(None, "m"), Some(Points::one_point("m", 1.0, 10)));
    }

    #[test]
    fn test_checkpoint_emits_stats_and_resets_counters() {
        let mut state = state_with(0);
        state.ingest(Points::one_point("m", 1.0, 10));
        state.lookup(None, "m");
        state.lookup(None, "other");

        state.rebuild_queue();
        state.finish_checkpoint(Duration::from_millis(3), 7, 5);

        assert_eq!(state.query_cnt, 0);
        assert_eq!(state.overflow_cnt, 0);

        for stat in [
            "size",
            "metrics",
            "queries",
            "overflow",
            "checkpointTime",
            "inputLenBeforeCheckpoint",
            "inputLenAfterCheckpoint",
        ] {
            let metric = format!("carbon.cache.{}", stat);
            assert!(state.data.contains_key(&metric), "missing stat {}", metric);
        }

        // The "queries" stat reflects the period that just ended.
        let queries = state.data.get("carbon.cache.queries").unwrap();
        assert_eq!(queries.data[0].value, 2.0);

        // Stat entries queue at the tail with count 1, so they drain first.
        assert_eq!(
            state.pop().map(|p| p.metric),
            Some("carbon.cache.inputLenAfterCheckpoint".to_string())
        );
        assert_size_invariant(&state);
    }

    #[test]
    fn test_checkpoint_counts_reflect_live_map() {
        let mut state = state_with(0);
        for i in 0..3 {
            state.ingest(Points::one_point("m", i as f64, i));
        }
        state.rebuild_queue();

        // Samples added after a rebuild make the cached count stale; that is
        // fine and corrects itself at the next rebuild.
        state.ingest(Points::one_point("m", 9.0, 9));
        assert_eq!(state.queue[0].count, 3);
        assert_eq!(state.data.get("m").map(|p| p.len()), Some(4));

        state.rebuild_queue();
        assert_eq!(state.queue[0].count, 4);
    }
}
