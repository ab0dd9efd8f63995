//! Voice and video calls over the signaling bus.
//!
//! Split in two layers. The [`CallEngine`] owns the WebRTC session for one
//! call at a time: media capture, the peer connection, SDP negotiation and
//! ICE candidate exchange. The [`CallCoordinator`] sits above it and speaks
//! the wire protocol: it rings, accepts, rejects and ends calls by
//! exchanging [`CallSignal`] envelopes on the per-user call channel, and
//! drives the engine accordingly.
//!
//! # Signal flow
//!
//! The caller sends `CALL_REQUEST` and waits; the callee answers with
//! `CALL_ACCEPTED` or `CALL_REJECTED`. On accept the caller sends the SDP
//! `OFFER`, the callee replies with `ANSWER`, and both sides trickle
//! `ICE_CANDIDATE`s until the peer connection is up. Either side closes the
//! call with `CALL_ENDED`; an unanswered outgoing call is withdrawn with
//! `CALL_CANCELLED`.

mod coordinator;
mod engine;
mod error;
mod session;
mod signal;

pub use coordinator::{
    ActiveCall, BusSignalSender, CallCoordinator, CallState, CoordinatorEvent, EndReason,
    RingingCall,
};
pub use engine::{CallEngine, EngineEvent, OutboundSignal, SignalSender};
pub use error::{CallError, Result};
pub use session::{CallDirection, CallSession, InvalidTransition, SessionPhase, SessionTransition};
pub use signal::{CallKind, CallSignal, SignalKind};
