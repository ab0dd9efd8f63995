/// Connection settings for the message bus transport.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// WebSocket endpoint of the STOMP broker, e.g. `wss://rt.ridewire.app/ws`.
    pub endpoint: String,
    /// Virtual host sent in the CONNECT frame.
    pub host: String,
    /// Desired outgoing heartbeat interval in milliseconds (0 disables).
    pub heartbeat_send_ms: u64,
    /// Desired incoming heartbeat interval in milliseconds (0 disables).
    pub heartbeat_recv_ms: u64,
    /// Delay between reconnect attempts.
    pub reconnect_delay_secs: u64,
    /// Reconnect attempts before giving up and reporting a terminal
    /// disconnect. 0 retries indefinitely.
    pub max_reconnect_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            host: "ridewire".to_string(),
            heartbeat_send_ms: 10_000,
            heartbeat_recv_ms: 10_000,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 5,
        }
    }
}

/// Settings for the call signaling engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// STUN/TURN server URLs handed to the peer connection factory.
    pub ice_servers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}
