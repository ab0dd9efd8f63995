//! Call-related error types.

use thiserror::Error;

use super::session::InvalidTransition;
use crate::bus::BusError;

pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no active peer connection")]
    NotInitialized,

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("signaling send failed: {0}")]
    Signaling(String),

    #[error("audio routing failed: {0}")]
    AudioRouting(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("another call is already active")]
    Busy,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error(transparent)]
    Bus(#[from] BusError),
}
