//! Packet Relay
//!
//! Receives datagrams on an inherited connectionless socket. Every distinct
//! source address gets its own outbound connection to the destination (a
//! [`Session`]); replies read from that connection are sent back to the
//! source. A session lives as long as traffic keeps refreshing its idle
//! deadline.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn, Level};

use super::destination::Destination;
use super::net::{Connection, PacketSocket, PeerAddr, ReadHalf};
use super::session::{Session, SessionError, SessionTable};
use super::stats::{RelayStats, StatsSnapshot};
use super::RelayOptions;
use crate::shutdown::{RelayLifecycle, StopObserver};
use crate::Result;

/// Relay for one inherited datagram socket
#[derive(Debug, Clone)]
pub struct PacketRelay {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Held until `start` hands it to the receive loop
    socket: Mutex<Option<PacketSocket>>,
    local: String,
    destination: Destination,
    options: RelayOptions,
    sessions: SessionTable,
    lifecycle: RelayLifecycle,
    stats: Arc<RelayStats>,
}

impl PacketRelay {
    /// Build a relay from an inherited datagram descriptor
    pub fn from_fd(fd: OwnedFd, destination: &str, options: RelayOptions) -> Result<Self> {
        Ok(Self::new(PacketSocket::from_fd(fd)?, destination, options))
    }

    /// Build a relay around an already bound datagram socket
    pub fn new(socket: PacketSocket, destination: &str, options: RelayOptions) -> Self {
        let destination = Destination::resolve(destination, &socket.origin());
        let local = socket.local_label();
        Self {
            inner: Arc::new(Inner {
                socket: Mutex::new(Some(socket)),
                local,
                destination,
                options,
                sessions: SessionTable::new(),
                lifecycle: RelayLifecycle::new(),
                stats: Arc::new(RelayStats::new()),
            }),
        }
    }

    /// Spawn the receive loop. Returns `false` if the relay was already
    /// started or closed.
    pub fn start(&self) -> bool {
        let Some(socket) = self.inner.take_socket() else {
            warn!(local = %self.inner.local, "Packet relay already started or closed");
            return false;
        };

        info!(
            local = %self.inner.local,
            destination = %self.inner.destination,
            timeout = ?self.inner.options.timeout,
            buffer_size = self.inner.options.buffer_size,
            "Packet relay started"
        );
        tokio::spawn(Arc::clone(&self.inner).receive_loop(socket));
        true
    }

    /// Close the socket and retire every session. Safe to call any number
    /// of times.
    pub fn close(&self) {
        self.inner.lifecycle.request_close();
        if let Some(socket) = self.inner.take_socket() {
            drop(socket);
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

    /// Bound address of the datagram socket
    pub fn local_label(&self) -> &str {
        &self.inner.local
    }

    /// Number of client addresses with a live session
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    fn take_socket(&self) -> Option<PacketSocket> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn receive_loop(self: Arc<Self>, socket: PacketSocket) {
        // Session readers hold clones to send replies; the descriptor closes
        // once the last of them retires.
        let socket = Arc::new(socket);
        let mut close = self.lifecycle.close_requested();
        let mut buf = vec![0u8; self.options.buffer_size];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((0, _)) => continue,
                    Ok((n, peer)) => {
                        self.stats.record_accepted();
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        tokio::spawn(Arc::clone(&self).handle(Arc::clone(&socket), payload, peer));
                    }
                    Err(e) => {
                        error!(local = %self.local, "Receive failed: {}", e);
                        break;
                    }
                },
                _ = close.wait() => {
                    debug!(local = %self.local, "Close requested");
                    break;
                }
            }
        }

        drop(socket);
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
            datagrams = stats.accepted,
            sessions_created = stats.sessions_created,
            active_sessions = stats.active,
            dial_failures = stats.dial_failures,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            "Packet relay stopped"
        );
    }

    /// Forward one datagram through its source's session
    async fn handle(self: Arc<Self>, socket: Arc<PacketSocket>, payload: Bytes, peer: PeerAddr) {
        if peer == PeerAddr::Unnamed {
            debug!(local = %self.local, "Dropping datagram from unnamed unix peer");
            return;
        }

        let key = peer.to_string();
        let session = match self.sessions.get(&key) {
            Some(session) => session,
            None => match self.open_session(&socket, key, &peer).await {
                Some(session) => session,
                None => return,
            },
        };

        if let Err(e) = session.send(&payload).await {
            log_session_error(&peer, "Forwarding datagram failed", &e);
            return;
        }
        self.stats.add_bytes_up(payload.len() as u64);

        if let Err(e) = session.refresh() {
            log_session_error(&peer, "Refreshing idle deadline failed", &e);
        }
    }

    /// Dial the destination for a new source address and start its reader
    async fn open_session(
        self: &Arc<Self>,
        socket: &Arc<PacketSocket>,
        key: String,
        peer: &PeerAddr,
    ) -> Option<Arc<Session>> {
        let mut stopped = self.lifecycle.stopped();
        let connection = tokio::select! {
            dialed = Connection::dial(&self.destination, self.options.timeout) => match dialed {
                Ok(connection) => connection,
                Err(e) => {
                    self.stats.record_dial_failure();
                    warn!(peer = %peer, "{:#}", e);
                    return None;
                }
            },
            _ = stopped.wait() => return None,
        };

        let (reader, writer) = connection.into_split();
        let session = Arc::new(Session::new(key, writer, self.options.timeout));

        let current = self.sessions.insert_or_get(Arc::clone(&session));
        if !Arc::ptr_eq(&current, &session) {
            debug!(peer = %peer, "Session opened concurrently, discarding duplicate connection");
            session.close().await;
            return Some(current);
        }

        self.stats.record_session_created();
        debug!(peer = %peer, destination = %self.destination, "Session opened");
        tokio::spawn(Arc::clone(self).pump_replies(
            Arc::clone(socket),
            Arc::clone(&session),
            reader,
            peer.clone(),
        ));
        Some(session)
    }

    /// Send everything the destination returns back to `peer` until the
    /// session goes idle, fails, or the relay stops. Then retire it.
    ///
    /// Write-backs race the idle deadline and the stop signal as well, so a
    /// peer that stops reading cannot pin the session.
    async fn pump_replies(
        self: Arc<Self>,
        socket: Arc<PacketSocket>,
        session: Arc<Session>,
        mut reader: ReadHalf,
        peer: PeerAddr,
    ) {
        let _active = self.stats.track_active();
        let mut stopped = self.lifecycle.stopped();
        let mut buf = vec![0u8; self.options.buffer_size];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(peer = %peer, "Destination closed the session");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(peer = %peer, "Reading from destination failed: {}", e);
                        break;
                    }
                },
                _ = session.idle() => {
                    debug!(peer = %peer, "Session idle, retiring");
                    break;
                }
                _ = stopped.wait() => {
                    debug!(peer = %peer, "Relay stopped, retiring session");
                    break;
                }
            };
            let _ = session.refresh();

            tokio::select! {
                sent = socket.send_to(&buf[..n], &peer) => match sent {
                    Ok(_) => self.stats.add_bytes_down(n as u64),
                    Err(e) => {
                        warn!(peer = %peer, "Sending reply failed: {}", e);
                        break;
                    }
                },
                _ = session.idle() => {
                    debug!(peer = %peer, "Peer not taking replies, retiring idle session");
                    break;
                }
                _ = stopped.wait() => {
                    debug!(peer = %peer, "Relay stopped while sending reply, retiring session");
                    break;
                }
            }
        }

        // Remove before closing so no handler picks up a closing session
        self.sessions.remove(&session);
        session.close().await;
        drop(reader);
        debug!(peer = %peer, "Session closed");
    }
}

/// Closed sessions are expected while a relay shuts down or a session
/// retires under a handler; anything else deserves a warning.
fn session_error_level(error: &SessionError) -> Level {
    if error.is_closed() {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

fn log_session_error(peer: &PeerAddr, context: &str, error: &SessionError) {
    if session_error_level(error) == Level::DEBUG {
        debug!(peer = %peer, "{}: {}", context, error);
    } else {
        warn!(peer = %peer, "{}: {}", context, error);
    }
}
