// Connection status monitor: maps driver lifecycle updates to log events.
//
// Read-only telemetry. The monitor never drives reconnection; that stays
// with the transport driver.
use crate::{BusTransport, ConnectionStatus};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusLogPolicy {
    /// Ping timeouts are frequent on idle links; only log them when asked.
    pub log_ping_timeouts: bool,
}

/// Consume the transport's status stream until it closes, logging each
/// update at a level matching its severity.
pub fn spawn_status_monitor(
    transport: &Arc<dyn BusTransport>,
    policy: StatusLogPolicy,
) -> JoinHandle<()> {
    let mut updates = transport.status();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(status) => log_status(&status, policy),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status monitor lagged behind driver updates");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_status(status: &ConnectionStatus, policy: StatusLogPolicy) {
    match status {
        ConnectionStatus::Error(detail) => error!(detail = %detail, "bus connection error"),
        ConnectionStatus::Disconnected => error!("bus connection lost"),
        ConnectionStatus::PingTimeout => {
            if policy.log_ping_timeouts {
                debug!("bus ping timed out");
            }
        }
        ConnectionStatus::Connecting => info!("bus connecting"),
        ConnectionStatus::Connected => info!("bus connected"),
    }
}
