//! Plaintext line-protocol receivers.
//!
//! Both transports accept `<metric> <value> <timestamp>\n` lines and feed
//! single-sample [`Points`] into the cache input channel. TCP carries a
//! partial trailing line over to the next read; UDP parses every datagram
//! independently. Unparseable lines and a full input channel are counted
//! and dropped, never fatal.

pub mod tcp;
pub mod udp;

pub use tcp::TcpReceiver;
pub use udp::UdpReceiver;

use crate::core::types::Points;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Listener configuration, applied atomically via `apply()`.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Address to listen on, e.g. `127.0.0.1:2003`.
    pub listen_addr: String,
    /// Whether the listener is bound at all.
    pub enabled: bool,
    /// UDP only: render datagrams with a truncated trailing line to the log.
    pub log_incomplete: bool,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        ReceiverSettings {
            listen_addr: "127.0.0.1:2003".to_string(),
            enabled: false,
            log_incomplete: false,
        }
    }
}

/// Shared receiver counters. Plain atomics; snapshots are advisory.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// Samples parsed and handed to the cache.
    pub received: AtomicU64,
    /// Lines that failed to parse.
    pub errors: AtomicU64,
    /// Datagrams (or streams at EOF) with a truncated trailing line.
    pub incomplete: AtomicU64,
    /// Points dropped because the cache input channel was full.
    pub dropped: AtomicU64,
    /// Live TCP connections.
    pub connections: AtomicU64,
}

/// A point-in-time copy of [`ReceiverStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub errors: u64,
    pub incomplete: u64,
    pub dropped: u64,
    pub connections: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    /// Renders the per-period counters as self-monitoring points, named
    /// `<prefix><proto>.<counter>`, and resets them. Meant to be fed back
    /// into the cache so receiver health flows through the ordinary path.
    pub fn stat_points(&self, prefix: &str, proto: &str) -> Vec<Points> {
        let stat = |name: &str, value: u64| {
            Points::now_point(&format!("{}{}.{}", prefix, proto, name), value as f64)
        };
        vec![
            stat("received", self.received.swap(0, Ordering::Relaxed)),
            stat("errors", self.errors.swap(0, Ordering::Relaxed)),
            stat("incomplete", self.incomplete.swap(0, Ordering::Relaxed)),
            stat("dropped", self.dropped.swap(0, Ordering::Relaxed)),
        ]
    }
}

/// A bound listener: its address, the shutdown signal, and the task to join.
pub(crate) struct Active {
    pub(crate) local_addr: SocketAddr,
    pub(crate) log_incomplete: Arc<AtomicBool>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) task: JoinHandle<()>,
}

impl Active {
    /// Signals the listener task and waits for it to exit.
    pub(crate) async fn shutdown(self) -> crate::core::error::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        Ok(())
    }
}

/// Parses one line and forwards the sample; drops and counts on failure.
pub(crate) fn emit_line(line: &str, out: &mpsc::Sender<Points>, stats: &ReceiverStats) {
    let points = match Points::parse_line(line) {
        Ok(points) => points,
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %e, line, "dropping unparseable line");
            return;
        },
    };
    match out.try_send(points) {
        Ok(()) => {
            stats.received.fetch_add(1, Ordering::Relaxed);
        },
        Err(TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("cache input channel full, dropping point");
        },
        Err(TrySendError::Closed(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("cache input channel closed, dropping point");
        },
    }
}

/// Renders a datagram with a truncated trailing line for the log.
///
/// One line is logged verbatim; two lines are joined by the literal escape
/// `\n`; for three or more, the middle region is collapsed to its byte
/// count: `first\n...(K bytes)...\nlast`.
pub(crate) fn format_incomplete(datagram: &str) -> String {
    let first_nl = match datagram.find('\n') {
        Some(pos) => pos,
        None => return datagram.to_string(),
    };
    let last_nl = datagram.rfind('\n').unwrap_or(first_nl);
    let first = &datagram[..first_nl];
    let last = &datagram[last_nl + 1..];

    if first_nl == last_nl {
        return format!("{}\\n{}", first, last);
    }
    let omitted = last_nl - first_nl - 1;
    format!("{}\\n...({} bytes)...\\n{}", first, omitted, last)
}
