use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
