//! init-proxyd - socket-activated relay daemon
//!
//! Takes the sockets launchd or systemd opened for this job and relays every
//! connection and datagram arriving on them to one destination.

use anyhow::Result;
use clap::Parser;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use init_proxyd::{
    activation::{self, launchd::DEFAULT_PLIST, SocketSource},
    config::{Backend, CliOverrides, ConfigManager},
    Config, ShutdownCoordinator, Supervisor,
};

/// Exit status for invalid flags or configuration
const EXIT_USAGE: u8 = 2;

/// Exit status for activation failures and relays that stop unexpectedly
const EXIT_FAILURE: u8 = 1;

/// CLI arguments for init-proxyd
#[derive(Parser, Debug)]
#[command(name = "init-proxyd")]
#[command(about = "Relay sockets inherited from launchd or systemd to one destination")]
#[command(version)]
#[command(long_about = "
Relay sockets inherited from launchd or systemd to one destination.

Every stream socket is relayed connection by connection; every datagram
socket through per-client sessions that expire after the timeout.

Destinations:
  :8080                     same network as the socket, loopback host
  tcp://10.0.0.2:80         explicit network and address
  udp6://[2001:db8::1]:53
  unix:///var/run/app.sock

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file (--config)
3. Environment variables (only without --config)
4. Built-in defaults

Environment variables:
  INIT_PROXYD_DESTINATION   - Destination address
  INIT_PROXYD_TIMEOUT       - Dial/idle timeout (e.g., 8s, 1m)
  INIT_PROXYD_BUFFER_SIZE   - Datagram buffer size in bytes
  INIT_PROXYD_BACKEND       - auto, systemd, launchd or fds
  INIT_PROXYD_SOCKETS       - Comma separated launchd socket names
  INIT_PROXYD_PLIST         - launchd job plist to read socket names from
  INIT_PROXYD_FDS           - Comma separated descriptor numbers
  INIT_PROXYD_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Destination address (overrides config file)
    #[arg(short, long, help = "Destination address (e.g., udp://127.0.0.1:53)")]
    pub destination: Option<String>,

    /// Dial timeout and packet session idle timeout
    #[arg(short, long, value_parser = humantime::parse_duration, help = "Timeout (e.g., 8s)")]
    pub timeout: Option<Duration>,

    /// Datagram buffer size in bytes
    #[arg(short, long, help = "UDP buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Socket activation backend
    #[arg(long, value_enum, help = "Socket activation backend")]
    pub backend: Option<Backend>,

    /// launchd socket names
    #[arg(short, long = "socket", help = "launchd socket name (repeatable)")]
    pub sockets: Vec<String>,

    /// launchd job plist whose `Sockets` keys name the sockets
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = DEFAULT_PLIST,
        help = "Read launchd socket names from a plist ('-' for just Socket)"
    )]
    pub plist: Option<PathBuf>,

    /// Inherited descriptor numbers
    #[arg(long = "fd", help = "Inherited file descriptor (repeatable)")]
    pub fds: Vec<RawFd>,

    /// Keep LISTEN_* variables in the environment
    #[arg(long, help = "Do not unset systemd LISTEN_* variables")]
    pub keep_environment: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            destination: self.destination.clone(),
            timeout: self.timeout,
            buffer_size: self.buffer_size,
            backend: self.backend,
            sockets: self.sockets.clone(),
            plist: self.plist.clone(),
            fds: self.fds.clone(),
            keep_environment: self.keep_environment,
            log_level: self.log_level.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Configuration comes first so its log level can drive tracing
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("init-proxyd: {:#}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    init_tracing(&args, &config);

    info!("Starting init-proxyd v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        log_config_summary(&config);
        return ExitCode::SUCCESS;
    }

    // systemd's LISTEN_* variables are read and unset here, while the
    // process still has a single thread
    let mut source = activation::source_from_config(&config.activation);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match runtime.block_on(run(config, source.as_mut())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Load configuration with priority: CLI args > config file > environment > defaults
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load_from_env()?,
    };

    config.merge_with_cli_args(&args.overrides());
    config.validate()?;
    Ok(config)
}

async fn run(config: Config, source: &mut dyn SocketSource) -> Result<()> {
    log_config_summary(&config);

    let sockets = activation::activate(source)?;
    info!(
        "Found sockets: {}",
        sockets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let supervisor = Supervisor::launch(sockets, &config.relay.destination, config.relay.options())?;
    let shutdown_coordinator = ShutdownCoordinator::new();

    info!("init-proxyd started successfully");

    supervisor
        .run(shutdown_coordinator.listen_for_signals())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

fn log_config_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Destination: {}", config.relay.destination);
    info!("  Timeout: {:?}", config.relay.timeout);
    info!("  Buffer size: {} bytes", config.relay.buffer_size);
    info!("  Activation backend: {:?}", config.activation.backend.resolve());
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &config.logging.level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false),
        )
        .with(env_filter)
        .init();
}
