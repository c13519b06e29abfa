//! Relay Supervision
//!
//! Builds one relay per inherited socket, starts them, and watches their
//! stopped signals. Relays are never expected to stop on their own, so the
//! first one that does is reported to the caller, which treats it as fatal.

use std::future::Future;

use anyhow::{anyhow, Context};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::activation::InheritedSocket;
use crate::relay::{Relay, RelayOptions};
use crate::shutdown::ShutdownReason;
use crate::Result;

/// Owns every running relay of the process
#[derive(Debug)]
pub struct Supervisor {
    relays: Vec<Relay>,
}

impl Supervisor {
    /// Build and start a relay for every socket, all forwarding to
    /// `destination`. If any relay cannot be built, the ones built so far
    /// are closed and the error is returned.
    pub fn launch(
        sockets: Vec<InheritedSocket>,
        destination: &str,
        options: RelayOptions,
    ) -> Result<Self> {
        let mut relays = Vec::with_capacity(sockets.len());
        for socket in sockets {
            let label = socket.to_string();
            let built = Relay::from_fd(socket.fd, socket.kind, destination, options)
                .with_context(|| format!("Failed to build relay for {}", label));
            match built {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    relays.iter().for_each(Relay::close);
                    return Err(e);
                }
            }
        }
        Ok(Self::start(relays))
    }

    /// Start already built relays
    pub fn start(relays: Vec<Relay>) -> Self {
        for relay in &relays {
            relay.start();
        }
        info!(count = relays.len(), "All relays started");
        Self { relays }
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    /// Wait until any relay stops and return its index. Never resolves
    /// when there are no relays.
    pub async fn wait_any(&self) -> usize {
        let mut waiting = JoinSet::new();
        for (index, relay) in self.relays.iter().enumerate() {
            let mut stopped = relay.stopped();
            waiting.spawn(async move {
                stopped.wait().await;
                index
            });
        }

        while let Some(joined) = waiting.join_next().await {
            match joined {
                Ok(index) => {
                    let relay = &self.relays[index];
                    error!(
                        kind = %relay.kind(),
                        local = %relay.local_label(),
                        destination = %relay.destination(),
                        "Relay exited"
                    );
                    return index;
                }
                Err(e) => error!("Relay watcher failed: {}", e),
            }
        }
        std::future::pending().await
    }

    /// Serve until `shutdown` resolves or a relay stops on its own, then stop
    /// every relay. A relay exiting and a failing `shutdown` future are both
    /// errors; only a received shutdown request ends the run cleanly.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<ShutdownReason>>,
    {
        let outcome = tokio::select! {
            index = self.wait_any() => {
                Err(anyhow!("Relay on {} exited", self.relays[index].local_label()))
            }
            signal = shutdown => match signal {
                Ok(reason) => {
                    info!(?reason, "Initiating graceful shutdown...");
                    Ok(())
                }
                Err(e) => Err(e.context("Failed to wait for shutdown signals")),
            },
        };

        self.shutdown().await;
        outcome
    }

    /// Close every relay and wait for all of them to report stopped
    pub async fn shutdown(&self) {
        info!(count = self.relays.len(), "Stopping relays");
        for relay in &self.relays {
            relay.close();
        }
        for relay in &self.relays {
            relay.stopped().wait().await;
        }
        info!("All relays stopped");
    }
}
