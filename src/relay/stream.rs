//! Stream Relay
//!
//! Accepts connections on an inherited listening socket and pipes each one,
//! in both directions, to a freshly dialed connection to the destination.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::destination::Destination;
use super::net::{Connection, Listener, PeerAddr};
use super::stats::{RelayStats, StatsSnapshot};
use super::RelayOptions;
use crate::shutdown::{RelayLifecycle, StopObserver};
use crate::Result;

/// Copy direction of one half of a relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to destination
    Up,
    /// Destination to client
    Down,
}

/// Relay for one inherited listening socket
#[derive(Debug, Clone)]
pub struct StreamRelay {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Held until `start` hands it to the accept loop
    listener: Mutex<Option<Listener>>,
    local: String,
    destination: Destination,
    options: RelayOptions,
    lifecycle: RelayLifecycle,
    stats: Arc<RelayStats>,
}

impl StreamRelay {
    /// Build a relay from an inherited listening descriptor
    pub fn from_fd(fd: OwnedFd, destination: &str, options: RelayOptions) -> Result<Self> {
        Ok(Self::new(Listener::from_fd(fd)?, destination, options))
    }

    /// Build a relay around an already listening socket
    pub fn new(listener: Listener, destination: &str, options: RelayOptions) -> Self {
        let destination = Destination::resolve(destination, &listener.origin());
        let local = listener.local_label();
        Self {
            inner: Arc::new(Inner {
                listener: Mutex::new(Some(listener)),
                local,
                destination,
                options,
                lifecycle: RelayLifecycle::new(),
                stats: Arc::new(RelayStats::new()),
            }),
        }
    }

    /// Spawn the accept loop. Returns `false` if the relay was already
    /// started or closed.
    pub fn start(&self) -> bool {
        let Some(listener) = self.inner.take_listener() else {
            warn!(local = %self.inner.local, "Stream relay already started or closed");
            return false;
        };

        info!(
            local = %self.inner.local,
            destination = %self.inner.destination,
            "Stream relay started"
        );
        tokio::spawn(Arc::clone(&self.inner).accept_loop(listener));
        true
    }

    /// Close the listening socket. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.lifecycle.request_close();
        // Never started: no accept loop will release the socket
        if let Some(listener) = self.inner.take_listener() {
            drop(listener);
            self.inner.finish();
        }
    }

    /// Observer raised once the relay has stopped
    pub fn stopped(&self) -> StopObserver {
        self.inner.lifecycle.stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lifecycle.is_stopped()
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// Bound address of the listening socket
    pub fn local_label(&self) -> &str {
        &self.inner.local
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    fn take_listener(&self) -> Option<Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let mut close = self.lifecycle.close_requested();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        self.stats.record_accepted();
                        tokio::spawn(Arc::clone(&self).handle(inbound, peer));
                    }
                    Err(e) => {
                        error!(local = %self.local, "Accept failed: {}", e);
                        break;
                    }
                },
                _ = close.wait() => {
                    debug!(local = %self.local, "Close requested");
                    break;
                }
            }
        }

        drop(listener);
        self.finish();
    }

    fn finish(&self) {
        if !self.lifecycle.finish() {
            return;
        }
        let stats = self.stats.snapshot();
        info!(
            local = %self.local,
            destination = %self.destination,
            accepted = stats.accepted,
            active = stats.active,
            dial_failures = stats.dial_failures,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            "Stream relay stopped"
        );
    }

    /// Relay one accepted connection until both directions finish or the
    /// relay stops
    async fn handle(self: Arc<Self>, inbound: Connection, peer: PeerAddr) {
        let mut stopped = self.lifecycle.stopped();

        let outbound = tokio::select! {
            dialed = Connection::dial(&self.destination, self.options.timeout) => match dialed {
                Ok(outbound) => outbound,
                Err(e) => {
                    self.stats.record_dial_failure();
                    warn!(peer = %peer, "{:#}", e);
                    return;
                }
            },
            _ = stopped.wait() => return,
        };

        let _active = self.stats.track_active();
        debug!(peer = %peer, destination = %self.destination, "Relaying connection");

        let (in_read, in_write) = inbound.into_split();
        let (out_read, out_write) = outbound.into_split();

        let (done_tx, mut done_rx) = mpsc::channel(2);
        let upstream = tokio::spawn(pipe(in_read, out_write, Direction::Up, done_tx.clone()));
        let downstream = tokio::spawn(pipe(out_read, in_write, Direction::Down, done_tx));

        let mut pending = 2;
        while pending > 0 {
            tokio::select! {
                Some((direction, copied)) = done_rx.recv() => {
                    pending -= 1;
                    match copied {
                        Ok(bytes) if direction == Direction::Up => self.stats.add_bytes_up(bytes),
                        Ok(bytes) => self.stats.add_bytes_down(bytes),
                        Err(e) => warn!(peer = %peer, ?direction, "Copy failed: {}", e),
                    }
                }
                _ = stopped.wait() => {
                    debug!(peer = %peer, "Relay stopped, dropping connection");
                    break;
                }
            }
        }

        // Releases both connections when the relay stopped mid-copy
        upstream.abort();
        downstream.abort();
        debug!(peer = %peer, "Connection closed");
    }
}

/// Copy until EOF or error, then half-close the writer and report
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    done: mpsc::Sender<(Direction, io::Result<u64>)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = tokio::io::copy(&mut reader, &mut writer).await;
    if copied.is_ok() {
        if let Err(e) = writer.shutdown().await {
            if e.kind() != io::ErrorKind::NotConnected {
                copied = Err(e);
            }
        }
    }
    let _ = done.send((direction, copied)).await;
}
