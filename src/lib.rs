//! init-proxyd
//!
//! Relays traffic from sockets inherited from launchd or systemd to a single
//! destination. Stream sockets are relayed connection by connection, datagram
//! sockets through per-client sessions that expire after an idle timeout.

pub mod activation;
pub mod config;
pub mod relay;
pub mod shutdown;
pub mod supervisor;

pub use config::Config;
pub use relay::{Relay, RelayOptions, SocketKind};
pub use shutdown::{ShutdownCoordinator, StopSignal};
pub use supervisor::Supervisor;

/// Common error type for the relay daemon
pub type Result<T> = anyhow::Result<T>;
