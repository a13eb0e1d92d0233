//! Periodic VLAN range re-derivation
//!
//! Configuration changes reach the pools even when no reservation happens
//! on a cluster for a long time.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use super::registry::ClusterRegistry;

/// Default re-derivation interval in seconds
pub const DEFAULT_REDERIVE_INTERVAL_SECS: u64 = 60;

/// Spawn the re-derive driver as a background task
///
/// Dropping or signalling the returned sender stops the task.
pub fn spawn_rederive_driver(registry: ClusterRegistry, period: Duration) -> watch::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        let mut ticker = interval(period);

        info!("Re-derive driver started, running every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (cluster, range) in registry.rederive_all().await {
                        debug!("Cluster {} VLAN range is {}", cluster, range);
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Re-derive driver shutting down");
                    break;
                }
            }
        }
    });

    shutdown_tx
}
