//! Call session state machine.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::signal::CallKind;
use crate::platform::{MediaStream, PeerConnection};

/// Who dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lifecycle phase of a single call session.
///
/// A session object only exists from media acquisition onward; the idle
/// phase is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Capturing local media, peer connection not wired yet.
    #[default]
    AcquiringMedia,
    /// Local media attached; waiting for the remote description and for
    /// ICE to complete.
    AwaitingRemoteDescription,
    /// Media flowing both ways.
    Connected,
    /// Torn down in an orderly fashion.
    Ended,
    /// Transport gave up; teardown follows.
    Failed,
}

/// Phase transitions applied by the engine.
#[derive(Debug, Clone, Copy)]
pub enum SessionTransition {
    MediaReady,
    PeerConnected,
    ConnectionFailed,
    Ended,
}

/// Everything one call owns: the peer connection, both media streams and
/// the phase bookkeeping. Dropped wholesale on teardown.
pub struct CallSession {
    pub call_id: String,
    pub peer_id: String,
    pub direction: CallDirection,
    pub kind: CallKind,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub pc: Arc<dyn PeerConnection>,
    pub local_stream: Arc<MediaStream>,
    pub remote_stream: Option<Arc<MediaStream>>,
    pub speaker_on: bool,
}

impl CallSession {
    pub fn new(
        call_id: String,
        peer_id: String,
        direction: CallDirection,
        kind: CallKind,
        pc: Arc<dyn PeerConnection>,
        local_stream: Arc<MediaStream>,
    ) -> Self {
        Self {
            call_id,
            peer_id,
            direction,
            kind,
            phase: SessionPhase::AcquiringMedia,
            created_at: Utc::now(),
            connected_at: None,
            pc,
            local_stream,
            remote_stream: None,
            speaker_on: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, SessionPhase::Connected)
    }

    pub fn is_over(&self) -> bool {
        matches!(self.phase, SessionPhase::Ended | SessionPhase::Failed)
    }

    /// Seconds of talk time, once the call connected.
    pub fn duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|at| Utc::now().signed_duration_since(at).num_seconds())
    }

    pub fn apply_transition(
        &mut self,
        transition: SessionTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, transition) {
            (SessionPhase::AcquiringMedia, SessionTransition::MediaReady) => {
                SessionPhase::AwaitingRemoteDescription
            }
            (SessionPhase::AwaitingRemoteDescription, SessionTransition::PeerConnected) => {
                self.connected_at = Some(Utc::now());
                SessionPhase::Connected
            }
            // ICE restarts re-announce the connected state.
            (SessionPhase::Connected, SessionTransition::PeerConnected) => SessionPhase::Connected,
            (
                SessionPhase::AcquiringMedia
                | SessionPhase::AwaitingRemoteDescription
                | SessionPhase::Connected,
                SessionTransition::ConnectionFailed,
            ) => SessionPhase::Failed,
            (_, SessionTransition::Ended) => SessionPhase::Ended,
            (phase, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{phase:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("has_remote_stream", &self.remote_stream.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MediaStream;
    use crate::testing::MockPeerConnection;

    fn make_session(direction: CallDirection) -> CallSession {
        let (pc, _events) = MockPeerConnection::create();
        CallSession::new(
            "call-1".to_string(),
            "peer-9".to_string(),
            direction,
            CallKind::Video,
            pc,
            MediaStream::new("local"),
        )
    }

    #[test]
    fn test_happy_path_phases() {
        let mut session = make_session(CallDirection::Outgoing);
        assert_eq!(session.phase, SessionPhase::AcquiringMedia);

        session.apply_transition(SessionTransition::MediaReady).unwrap();
        assert_eq!(session.phase, SessionPhase::AwaitingRemoteDescription);
        assert!(!session.is_connected());

        session.apply_transition(SessionTransition::PeerConnected).unwrap();
        assert!(session.is_connected());
        assert!(session.connected_at.is_some());
        assert!(session.duration_secs().is_some());

        session.apply_transition(SessionTransition::Ended).unwrap();
        assert!(session.is_over());
    }

    #[test]
    fn test_repeated_connected_is_allowed() {
        let mut session = make_session(CallDirection::Incoming);
        session.apply_transition(SessionTransition::MediaReady).unwrap();
        session.apply_transition(SessionTransition::PeerConnected).unwrap();
        session.apply_transition(SessionTransition::PeerConnected).unwrap();
        assert!(session.is_connected());
    }

    #[test]
    fn test_failure_is_terminal_for_live_phases() {
        let mut session = make_session(CallDirection::Outgoing);
        session.apply_transition(SessionTransition::MediaReady).unwrap();
        session
            .apply_transition(SessionTransition::ConnectionFailed)
            .unwrap();
        assert_eq!(session.phase, SessionPhase::Failed);
        assert!(session.is_over());

        let err = session
            .apply_transition(SessionTransition::PeerConnected)
            .unwrap_err();
        assert!(err.to_string().contains("PeerConnected"));
    }

    #[test]
    fn test_media_ready_only_from_acquiring() {
        let mut session = make_session(CallDirection::Outgoing);
        session.apply_transition(SessionTransition::MediaReady).unwrap();
        assert!(session.apply_transition(SessionTransition::MediaReady).is_err());
    }
}
