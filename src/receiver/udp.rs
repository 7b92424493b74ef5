//! UDP line-protocol receiver. Every datagram is parsed on its own; a
//! truncated trailing line is dropped, optionally rendered to the log.

use super::{emit_line, format_incomplete, Active, ReceiverSettings, ReceiverStats};
use crate::core::error::{CinderError, Result};
use crate::core::types::Points;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};

const MAX_DATAGRAM: usize = 65536;

/// UDP receiver. Configuration changes go through [`UdpReceiver::apply`],
/// which rebinds or closes the socket as needed and never leaves the
/// receiver half-configured.
pub struct UdpReceiver {
    out: mpsc::Sender<Points>,
    stats: Arc<ReceiverStats>,
    state: Mutex<State>,
}

struct State {
    settings: ReceiverSettings,
    active: Option<Active>,
}

impl UdpReceiver {
    /// Creates a receiver that will feed the given cache input channel.
    /// Nothing is bound until settings with `enabled` are applied.
    pub fn new(out: mpsc::Sender<Points>) -> Self {
        UdpReceiver {
            out,
            stats: Arc::new(ReceiverStats::default()),
            state: Mutex::new(State {
                settings: ReceiverSettings::default(),
                active: None,
            }),
        }
    }

    /// Copy of the current settings.
    pub async fn settings(&self) -> ReceiverSettings {
        self.state.lock().await.settings.clone()
    }

    /// Bound address, once enabled. Useful with a `:0` listen address.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.active.as_ref().map(|a| a.local_addr)
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Applies new settings atomically. Rebinds when the address changed,
    /// tears down when disabled; a flipped `log_incomplete` alone is pushed
    /// into the running task without a rebind. Bind failures are returned
    /// and leave the previous socket closed.
    pub async fn apply(&self, settings: ReceiverSettings) -> Result<()> {
        let mut state = self.state.lock().await;

        let rebind = match &state.active {
            Some(_) => !settings.enabled || settings.listen_addr != state.settings.listen_addr,
            None => settings.enabled,
        };

        if !rebind {
            if let Some(active) = &state.active {
                active
                    .log_incomplete
                    .store(settings.log_incomplete, Ordering::Relaxed);
            }
            state.settings = settings;
            return Ok(());
        }

        if let Some(active) = state.active.take() {
            active.shutdown().await?;
        }

        if settings.enabled {
            let socket = UdpSocket::bind(&settings.listen_addr).await.map_err(|e| {
                CinderError::network(format!(
                    "failed to bind udp {}: {}",
                    settings.listen_addr, e
                ))
            })?;
            let local_addr = socket.local_addr()?;
            let log_incomplete = Arc::new(AtomicBool::new(settings.log_incomplete));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(listen(
                socket,
                self.out.clone(),
                Arc::clone(&self.stats),
                Arc::clone(&log_incomplete),
                shutdown_rx,
            ));
            tracing::info!(addr = %local_addr, "udp receiver listening");
            state.active = Some(Active {
                local_addr,
                log_incomplete,
                shutdown: shutdown_tx,
                task,
            });
        }

        state.settings = settings;
        Ok(())
    }

    /// Closes the socket and waits for the read task to exit.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.settings.enabled = false;
        if let Some(active) = state.active.take() {
            active.shutdown().await?;
        }
        Ok(())
    }
}

async fn listen(
    socket: UdpSocket,
    out: mpsc::Sender<Points>,
    stats: Arc<ReceiverStats>,
    log_incomplete: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => handle_datagram(
                    &buf[..n],
                    peer,
                    &out,
                    &stats,
                    log_incomplete.load(Ordering::Relaxed),
                ),
                Err(e) => tracing::info!(error = %e, "udp read error"),
            },
        }
    }
    tracing::info!("udp receiver stopped");
}

fn handle_datagram(
    buf: &[u8],
    peer: SocketAddr,
    out: &mpsc::Sender<Points>,
    stats: &ReceiverStats,
    log_incomplete: bool,
) {
    let text = match std::str::from_utf8(buf) {
        Ok(text) => text,
        Err(_) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %peer, "dropping non-utf8 datagram");
            return;
        },
    };

    let mut rest = text;
    while let Some(pos) = rest.find('\n') {
        emit_line(&rest[..pos], out, stats);
        rest = &rest[pos + 1..];
    }

    if !rest.is_empty() {
        stats.incomplete.fetch_add(1, Ordering::Relaxed);
        if log_incomplete {
            tracing::warn!(
                peer = %peer,
                datagram = %format_incomplete(text),
                "incomplete datagram"
            );
        }
    }
}
