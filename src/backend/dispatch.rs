//! In-process command dispatch backed by an unbounded channel
//!
//! The dispatcher only enqueues; whoever owns the receiving half is
//! responsible for delivery and any retry policy.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{ClusterCommand, CommandDispatcher, DispatchError};

/// A command together with the cluster it targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedCommand {
    pub cluster: String,
    pub command: ClusterCommand,
}

#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchedCommand>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandDispatcher for ChannelDispatcher {
    fn dispatch(&self, cluster: &str, command: ClusterCommand) -> Result<(), DispatchError> {
        self.tx
            .send(DispatchedCommand {
                cluster: cluster.to_string(),
                command,
            })
            .map_err(|_| DispatchError::Closed(cluster.to_string()))
    }
}

/// Drain dispatched commands, logging each one
///
/// Stands in for the cluster agent transport when running standalone.
pub fn spawn_command_logger(
    mut rx: mpsc::UnboundedReceiver<DispatchedCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(dispatched) = rx.recv().await {
            match serde_json::to_string(&dispatched.command) {
                Ok(body) => info!(cluster = %dispatched.cluster, "Dispatching {}", body),
                Err(e) => warn!("Failed to render command for {}: {}", dispatched.cluster, e),
            }
        }
        info!("Command dispatch queue closed");
    })
}
