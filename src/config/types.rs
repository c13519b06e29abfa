//! Configuration Types

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::activation::launchd::DEFAULT_SOCKET_NAME;
use crate::relay::{RelayOptions, DEFAULT_BUFFER_SIZE, DEFAULT_TIMEOUT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub activation: ActivationConfig,
    pub logging: LoggingConfig,
}

/// Where inherited sockets are relayed to
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Destination such as `udp://203.0.113.5:53`, `:8080` or
    /// `unix:///var/run/app.sock`
    pub destination: String,
    /// Dial timeout and idle timeout of packet sessions
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Datagram buffer size in bytes
    pub buffer_size: usize,
}

/// Init system protocol used to obtain the sockets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// launchd on macOS, systemd elsewhere
    #[default]
    Auto,
    Systemd,
    Launchd,
    /// Explicit descriptor numbers
    Fds,
}

/// Socket activation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub backend: Backend,
    /// launchd socket names (keys of the plist's `Sockets` dictionary)
    pub sockets: Vec<String>,
    /// launchd job plist to read socket names from; `-` means `Socket`
    pub plist: Option<PathBuf>,
    /// Descriptor numbers for the `fds` backend
    pub fds: Vec<RawFd>,
    /// Remove `LISTEN_*` variables after reading them
    pub unset_environment: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Backend {
    /// Replace `Auto` with the platform's init system
    pub fn resolve(self) -> Backend {
        match self {
            Backend::Auto if cfg!(target_os = "macos") => Backend::Launchd,
            Backend::Auto => Backend::Systemd,
            backend => backend,
        }
    }
}

impl RelayConfig {
    /// Relay tuning derived from this configuration
    pub fn options(&self) -> RelayOptions {
        RelayOptions::new(self.timeout, self.buffer_size)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            timeout: DEFAULT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            sockets: vec![DEFAULT_SOCKET_NAME.to_string()],
            plist: None,
            fds: Vec::new(),
            unset_environment: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
