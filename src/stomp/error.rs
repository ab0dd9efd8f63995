use thiserror::Error;

#[derive(Debug, Error)]
pub enum StompError {
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Frame exceeds maximum size: {0} bytes")]
    FrameTooLarge(usize),
    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("Invalid escape sequence in header")]
    InvalidEscape,
    #[error("Invalid content-length: {0:?}")]
    InvalidContentLength(String),
    #[error("Frame body is not terminated by NUL")]
    MissingTerminator,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Broker error: {0}")]
    Broker(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, StompError>;
