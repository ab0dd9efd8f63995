pub mod bus;
pub mod calls;
pub mod config;
pub mod platform;
pub mod stomp;
pub mod testing;
pub mod transport;

pub use bus::{ChannelKey, Multiplexer, Outbox};
pub use calls::{CallCoordinator, CallEngine};
pub use config::{BusConfig, EngineConfig};
