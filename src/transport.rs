use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected (or reconnected).
    Connected,
    /// A message arrived on a subscribed destination.
    Message { destination: String, body: Bytes },
    /// The connection was lost; the transport keeps retrying on its own.
    Disconnected,
    /// The transport gave up (retry budget exhausted or deliberate close).
    /// No further events follow.
    Closed,
    /// A protocol-level error reported by the broker.
    Error(String),
}

/// Credentials for establishing the physical connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub endpoint: String,
    pub login: String,
    pub passcode: String,
}

/// Represents an active connection to the message broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a broker-side subscription for a destination. Returns the
    /// subscription id used to tear it down.
    async fn subscribe(&self, destination: &str) -> Result<String, anyhow::Error>;

    /// Removes a broker-side subscription.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), anyhow::Error>;

    /// Sends a message body to a destination.
    async fn send(&self, destination: &str, body: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connects and returns the transport, along with a stream of events.
    /// Resolves once the broker has acknowledged the session.
    async fn create_transport(
        &self,
        params: &ConnectParams,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
