pub mod client;
pub mod error;
pub mod frame;

pub use client::{StompClient, StompTransportFactory};
pub use error::{Result, StompError};
pub use frame::{DecodeOutcome, StompCommand, StompFrame};
