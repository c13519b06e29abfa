//! Configuration Manager

use super::{Backend, Config};
use crate::Result;
use anyhow::{bail, Context};
use clap::ValueEnum;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest payload a UDP datagram can carry
const MAX_BUFFER_SIZE: usize = 65_535;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "INIT_PROXYD_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file. Missing sections and fields take
    /// their defaults.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from `INIT_PROXYD_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from variables provided by `lookup`
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(destination) = var("DESTINATION") {
            config.relay.destination = destination;
        }

        if let Some(timeout) = var("TIMEOUT") {
            config.relay.timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(buffer_size) = var("BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid {}BUFFER_SIZE: {}", ENV_PREFIX, buffer_size))?;
        }

        if let Some(backend) = var("BACKEND") {
            config.activation.backend = Backend::from_str(&backend, true)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}BACKEND: {}", ENV_PREFIX, backend))?;
        }

        if let Some(sockets) = var("SOCKETS") {
            config.activation.sockets = split_list(&sockets).map(str::to_string).collect();
        }

        if let Some(plist) = var("PLIST") {
            config.activation.plist = Some(PathBuf::from(plist));
        }

        if let Some(fds) = var("FDS") {
            config.activation.fds = split_list(&fds)
                .map(|fd| fd.parse::<RawFd>())
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Invalid {}FDS: {}", ENV_PREFIX, fds))?;
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// Values given on the command line; `None`/empty leaves the loaded value
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub destination: Option<String>,
    pub timeout: Option<Duration>,
    pub buffer_size: Option<usize>,
    pub backend: Option<Backend>,
    pub sockets: Vec<String>,
    pub plist: Option<PathBuf>,
    pub fds: Vec<RawFd>,
    pub keep_environment: bool,
    pub log_level: Option<String>,
}

impl Config {
    /// Apply command-line overrides (highest priority)
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(destination) = &overrides.destination {
            self.relay.destination = destination.clone();
        }
        if let Some(timeout) = overrides.timeout {
            self.relay.timeout = timeout;
        }
        if let Some(buffer_size) = overrides.buffer_size {
            self.relay.buffer_size = buffer_size;
        }
        if let Some(backend) = overrides.backend {
            self.activation.backend = backend;
        }
        if !overrides.sockets.is_empty() {
            self.activation.sockets = overrides.sockets.clone();
        }
        if let Some(plist) = &overrides.plist {
            self.activation.plist = Some(plist.clone());
        }
        if !overrides.fds.is_empty() {
            self.activation.fds = overrides.fds.clone();
            // Listing descriptors implies the fds backend unless one was named
            if overrides.backend.is_none() {
                self.activation.backend = Backend::Fds;
            }
        }
        if overrides.keep_environment {
            self.activation.unset_environment = false;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .context("Relay configuration validation failed")?;

        self.validate_activation_config()
            .context("Activation configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.destination.trim().is_empty() {
            bail!("destination must not be empty");
        }

        if self.relay.buffer_size > MAX_BUFFER_SIZE {
            bail!(
                "buffer_size cannot exceed {} bytes (largest UDP payload)",
                MAX_BUFFER_SIZE
            );
        }

        Ok(())
    }

    fn validate_activation_config(&self) -> Result<()> {
        match self.activation.backend.resolve() {
            Backend::Launchd
                if self.activation.sockets.is_empty() && self.activation.plist.is_none() =>
            {
                bail!("launchd backend needs at least one socket name or a plist");
            }
            Backend::Fds if self.activation.fds.is_empty() => {
                bail!("fds backend needs at least one file descriptor");
            }
            _ => {}
        }

        if let Some(fd) = self.activation.fds.iter().find(|fd| **fd < 0) {
            bail!("invalid file descriptor: {}", fd);
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("Invalid log level: {}", self.logging.level))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_need_destination() {
        let config = Config::default();
        assert_eq!(config.relay.timeout, Duration::from_secs(8));
        assert_eq!(config.relay.buffer_size, 512);
        assert_eq!(config.activation.sockets, vec!["Socket".to_string()]);
        assert!(config.activation.unset_environment);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_vars() {
        let config = ConfigManager::load_from_vars(vars(&[
            ("INIT_PROXYD_DESTINATION", "udp://127.0.0.1:53"),
            ("INIT_PROXYD_TIMEOUT", "30s"),
            ("INIT_PROXYD_BUFFER_SIZE", "1500"),
            ("INIT_PROXYD_BACKEND", "fds"),
            ("INIT_PROXYD_FDS", "3, 4"),
            ("INIT_PROXYD_PLIST", "/Library/LaunchDaemons/job.plist"),
            ("INIT_PROXYD_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.relay.destination, "udp://127.0.0.1:53");
        assert_eq!(config.relay.timeout, Duration::from_secs(30));
        assert_eq!(config.relay.buffer_size, 1500);
        assert_eq!(config.activation.backend, Backend::Fds);
        assert_eq!(config.activation.fds, vec![3, 4]);
        assert_eq!(
            config.activation.plist.as_deref(),
            Some(Path::new("/Library/LaunchDaemons/job.plist"))
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_vars_rejects_garbage() {
        assert!(ConfigManager::load_from_vars(vars(&[("INIT_PROXYD_TIMEOUT", "soon")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("INIT_PROXYD_BACKEND", "inetd")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("INIT_PROXYD_FDS", "3,x")])).is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        config.relay.destination = ":8080".to_string();

        config.merge_with_cli_args(&CliOverrides {
            destination: Some("tcp://10.0.0.2:80".to_string()),
            timeout: Some(Duration::from_secs(2)),
            fds: vec![3],
            keep_environment: true,
            ..Default::default()
        });

        assert_eq!(config.relay.destination, "tcp://10.0.0.2:80");
        assert_eq!(config.relay.timeout, Duration::from_secs(2));
        assert_eq!(config.relay.buffer_size, 512);
        assert_eq!(config.activation.backend, Backend::Fds);
        assert!(!config.activation.unset_environment);
    }

    #[test]
    fn test_validation_rules() {
        let mut config = Config::default();
        config.relay.destination = ":53".to_string();
        assert!(config.validate().is_ok());

        config.relay.buffer_size = 70_000;
        assert!(config.validate().is_err());
        config.relay.buffer_size = 512;

        config.activation.backend = Backend::Fds;
        assert!(config.validate().is_err());
        config.activation.fds = vec![-3];
        assert!(config.validate().is_err());
        config.activation.fds = vec![3];
        assert!(config.validate().is_ok());

        config.activation.backend = Backend::Launchd;
        config.activation.sockets.clear();
        assert!(config.validate().is_err());
        config.activation.plist = Some(PathBuf::from("-"));
        assert!(config.validate().is_ok());
    }
}
