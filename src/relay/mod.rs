//! Relay Engine
//!
//! A relay owns one inherited socket and forwards everything arriving on it
//! to a single destination. Stream sockets get a [`StreamRelay`], datagram
//! sockets a [`PacketRelay`]; [`Relay`] wraps either behind the same
//! start/close/stopped surface.

pub mod destination;
pub mod net;
pub mod packet;
pub mod session;
pub mod stats;
pub mod stream;

use std::fmt;
use std::os::fd::OwnedFd;
use std::time::Duration;

pub use destination::{Destination, Network, Origin};
pub use packet::PacketRelay;
pub use session::{Session, SessionError, SessionTable};
pub use stats::{RelayStats, StatsSnapshot};
pub use stream::StreamRelay;

use crate::shutdown::StopObserver;
use crate::Result;

/// Dial timeout and UDP idle timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Datagram buffer size used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Kind of an inherited socket, decided before a relay is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Listening, connection oriented socket (`SOCK_STREAM`)
    Stream,
    /// Connectionless socket (`SOCK_DGRAM`)
    Packet,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Stream => f.write_str("stream"),
            SocketKind::Packet => f.write_str("packet"),
        }
    }
}

/// Per-relay tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Dial timeout, and idle timeout of packet sessions
    pub timeout: Duration,
    /// Largest datagram a packet relay reads in one go
    pub buffer_size: usize,
}

impl RelayOptions {
    /// Zero values fall back to [`DEFAULT_TIMEOUT`] and [`DEFAULT_BUFFER_SIZE`]
    pub fn new(timeout: Duration, buffer_size: usize) -> Self {
        Self {
            timeout: if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout },
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size
            },
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_BUFFER_SIZE)
    }
}

/// A stream or packet relay
#[derive(Debug, Clone)]
pub enum Relay {
    Stream(StreamRelay),
    Packet(PacketRelay),
}

impl Relay {
    /// Build the relay matching `kind` around an inherited descriptor.
    /// Ownership of the descriptor moves into the relay.
    pub fn from_fd(
        fd: OwnedFd,
        kind: SocketKind,
        destination: &str,
        options: RelayOptions,
    ) -> Result<Self> {
        match kind {
            SocketKind::Stream => Ok(Relay::Stream(StreamRelay::from_fd(fd, destination, options)?)),
            SocketKind::Packet => Ok(Relay::Packet(PacketRelay::from_fd(fd, destination, options)?)),
        }
    }

    /// Spawn the relay's accept/receive loop
    pub fn start(&self) -> bool {
        match self {
            Relay::Stream(relay) => relay.start(),
            Relay::Packet(relay) => relay.start(),
        }
    }

    /// Close the relay's socket. Idempotent.
    pub fn close(&self) {
        match self {
            Relay::Stream(relay) => relay.close(),
            Relay::Packet(relay) => relay.close(),
        }
    }

    /// Observer raised once the relay has stopped
    pub fn stopped(&self) -> StopObserver {
        match self {
            Relay::Stream(relay) => relay.stopped(),
            Relay::Packet(relay) => relay.stopped(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self {
            Relay::Stream(relay) => relay.is_stopped(),
            Relay::Packet(relay) => relay.is_stopped(),
        }
    }

    pub fn kind(&self) -> SocketKind {
        match self {
            Relay::Stream(_) => SocketKind::Stream,
            Relay::Packet(_) => SocketKind::Packet,
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            Relay::Stream(relay) => relay.destination(),
            Relay::Packet(relay) => relay.destination(),
        }
    }

    pub fn local_label(&self) -> &str {
        match self {
            Relay::Stream(relay) => relay.local_label(),
            Relay::Packet(relay) => relay.local_label(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        match self {
            Relay::Stream(relay) => relay.stats(),
            Relay::Packet(relay) => relay.stats(),
        }
    }
}
