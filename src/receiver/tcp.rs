//! TCP line-protocol receiver. One task per connection; a partial trailing
//! line is carried over between reads by the buffered reader.

use super::{emit_line, Active, ReceiverSettings, ReceiverStats};
use crate::core::error::{CinderError, Result};
use crate::core::types::Points;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

/// TCP receiver. Same lifecycle as the UDP side: `apply()` rebinds or
/// closes atomically, `stop()` closes every connection and waits for the
/// accept and read tasks to exit.
pub struct TcpReceiver {
    out: mpsc::Sender<Points>,
    stats: Arc<ReceiverStats>,
    state: Mutex<State>,
}

struct State {
    settings: ReceiverSettings,
    active: Option<Active>,
}

impl TcpReceiver {
    /// Creates a receiver that will feed the given cache input channel.
    pub fn new(out: mpsc::Sender<Points>) -> Self {
        TcpReceiver {
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

    /// Bound address, once enabled.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.active.as_ref().map(|a| a.local_addr)
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Applies new settings atomically; see the UDP counterpart.
    pub async fn apply(&self, settings: ReceiverSettings) -> Result<()> {
        let mut state = self.state.lock().await;

        let rebind = match &state.active {
            Some(_) => !settings.enabled || settings.listen_addr != state.settings.listen_addr,
            None => settings.enabled,
        };

        if !rebind {
            state.settings = settings;
            return Ok(());
        }

        if let Some(active) = state.active.take() {
            active.shutdown().await?;
        }

        if settings.enabled {
            let listener = TcpListener::bind(&settings.listen_addr).await.map_err(|e| {
                CinderError::network(format!(
                    "failed to bind tcp {}: {}",
                    settings.listen_addr, e
                ))
            })?;
            let local_addr = listener.local_addr()?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(listen(
                listener,
                self.out.clone(),
                Arc::clone(&self.stats),
                shutdown_rx,
            ));
            tracing::info!(addr = %local_addr, "tcp receiver listening");
            state.active = Some(Active {
                local_addr,
                log_incomplete: Arc::new(AtomicBool::new(false)),
                shutdown: shutdown_tx,
                task,
            });
        }

        state.settings = settings;
        Ok(())
    }

    /// Closes the listener and all connections, then waits for the tasks.
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
    listener: TcpListener,
    out: mpsc::Sender<Points>,
    stats: Arc<ReceiverStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stats.connections.fetch_add(1, Ordering::Relaxed);
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        out.clone(),
                        Arc::clone(&stats),
                        shutdown.clone(),
                    ));
                },
                Err(e) => tracing::info!(error = %e, "tcp accept failed"),
            },
            // Reap finished connection tasks so the set stays bounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => {},
        }
    }

    // The shutdown watch has fired for every connection task; wait for them.
    while connections.join_next().await.is_some() {}
    tracing::info!("tcp receiver stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    out: mpsc::Sender<Points>,
    stats: Arc<ReceiverStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(peer = %peer, "connection accepted");
    let mut reader = BufReader::new(stream);
    let mut line: Vec<u8> = Vec::new();

    loop {
        line.clear();
        tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if line.last() != Some(&b'\n') {
                        // EOF in the middle of a line; drop the fragment.
                        stats.incomplete.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(peer = %peer, "discarding unfinished line at eof");
                        break;
                    }
                    match std::str::from_utf8(&line) {
                        Ok(text) => emit_line(text, &out, &stats),
                        Err(_) => {
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(peer = %peer, "dropping non-utf8 line");
                        },
                    }
                },
                Err(e) => {
                    tracing::info!(peer = %peer, error = %e, "read error, closing connection");
                    break;
                },
            },
        }
    }

    stats.connections.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(peer = %peer, "connection closed");
}
