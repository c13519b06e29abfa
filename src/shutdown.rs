//! Shutdown Coordination
//!
//! [`StopSignal`] is the one-shot termination signal every relay raises when
//! its accept/receive loop exits. Tasks spawned by the relay observe it to
//! stop blocking on I/O, and the supervisor observes it to detect relay
//! death. [`ShutdownCoordinator`] turns SIGTERM/SIGINT into a process-wide
//! shutdown request.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::Result;

/// One-shot, multi-observer termination signal
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    /// Create a signal in the lowered state
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    /// Whether the signal has been raised
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Get an observer. Observers created after the signal was raised
    /// complete immediately.
    pub fn subscribe(&self) -> StopObserver {
        StopObserver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`StopSignal`]
#[derive(Debug, Clone)]
pub struct StopObserver {
    rx: watch::Receiver<bool>,
}

impl StopObserver {
    /// Wait until the signal is raised.
    ///
    /// Also returns once every [`StopSignal`] handle is gone, since nothing
    /// can raise it any more.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Close request and termination signal of one relay.
///
/// `close` asks the relay's accept/receive loop to exit; the loop calls
/// [`RelayLifecycle::finish`] on its way out, which raises the stopped signal
/// exactly once.
#[derive(Debug, Clone, Default)]
pub struct RelayLifecycle {
    close_requested: StopSignal,
    stopped: StopSignal,
}

impl RelayLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the relay loop to exit. Idempotent.
    pub fn request_close(&self) {
        self.close_requested.trigger();
    }

    /// Observer the relay loop selects on
    pub fn close_requested(&self) -> StopObserver {
        self.close_requested.subscribe()
    }

    /// Raise the stopped signal. Returns `true` for the first caller only.
    pub fn finish(&self) -> bool {
        self.stopped.trigger()
    }

    /// Termination observer for spawned tasks and the owning process
    pub fn stopped(&self) -> StopObserver {
        self.stopped.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_triggered()
    }
}

/// Which process signal requested shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Terminate,
    Interrupt,
}

/// Turns process signals into a shutdown request
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    requested: StopSignal,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer raised once shutdown has been requested
    pub fn subscribe(&self) -> StopObserver {
        self.requested.subscribe()
    }

    /// Request shutdown without a process signal
    pub fn request_shutdown(&self) {
        self.requested.trigger();
    }

    /// Wait for SIGTERM or SIGINT, then raise the shutdown request
    pub async fn listen_for_signals(&self) -> Result<ShutdownReason> {
        info!("Starting shutdown signal listener");

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let reason = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                ShutdownReason::Terminate
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                ShutdownReason::Interrupt
            }
        };

        self.requested.trigger();
        Ok(reason)
    }
}
