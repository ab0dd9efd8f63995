pub mod channel;
pub mod error;
pub mod multiplexer;
pub mod outbox;

pub use channel::{ChannelKey, Identity};
pub use error::{BusError, Result};
pub use multiplexer::{BusEvent, Handler, Multiplexer, Subscription};
pub use outbox::{AckStatus, Acknowledgment, Outbox};
