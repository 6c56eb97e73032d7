// Transport seam between the dispatch layers and the underlying message bus.
//
// The dispatchers in tether-client and tether-server never talk to a socket;
// they publish and subscribe through the `BusTransport` trait. The driver
// behind it owns delivery, wildcard resolution, and reconnection policy.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tether_wire::Headers;
use tokio::sync::{broadcast, mpsc};

pub mod memory;
pub mod status;

pub use memory::{MemoryBus, MemoryConnector};
pub use status::{StatusLogPolicy, spawn_status_monitor};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not connected")]
    NotConnected,
    #[error("transport fault: {0}")]
    Fault(String),
}

/// Raw message as delivered by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Reply address attached by the publisher. Presence marks a request.
    pub reply: Option<String>,
    pub headers: Option<Headers>,
}

/// Connection lifecycle updates surfaced by the driver. Telemetry only;
/// reconnection stays the driver's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    PingTimeout,
    Error(String),
}

/// Live subscription binding. Dropping the handle tears the binding down.
pub struct BusSubscription {
    receiver: mpsc::Receiver<BusMessage>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    pub fn new(
        receiver: mpsc::Receiver<BusMessage>,
        canceller: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            canceller: Some(Box::new(canceller)),
        }
    }

    /// Await the next delivery. `None` once the binding is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Tear down the binding immediately. Equivalent to dropping the handle;
    /// named so release points read explicitly at call sites.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription").finish_non_exhaustive()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

/// Connection to a publish/subscribe bus.
#[async_trait]
pub trait BusTransport: Send + Sync + std::fmt::Debug {
    /// Publish a payload, optionally requesting replies on `reply`.
    /// Resolves once the local driver has accepted the message.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<&str>,
        headers: Option<Headers>,
    ) -> Result<()>;

    /// Bind a subscription. Wildcard resolution (`*` one token, `>` the
    /// rest) is the transport's job, not the dispatchers'. A queue group
    /// makes members compete for each delivery.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<BusSubscription>;

    /// Allocate a fresh ephemeral reply subject.
    fn new_inbox(&self) -> String;

    /// Subscribe to connection lifecycle updates.
    fn status(&self) -> broadcast::Receiver<ConnectionStatus>;

    /// Close the connection. Later calls fail with `NotConnected` instead
    /// of blocking.
    async fn close(&self) -> Result<()>;
}

/// Dials the underlying driver. Lazy connection sharing lives in the
/// dispatchers; a connector may be called once and its result reused.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusTransport>>;
}
