//! Call signaling engine: owns the single peer connection and runs the
//! SDP/ICE dance for one call at a time.
//!
//! The engine is deliberately unaware of the wire envelope. Inbound signals
//! arrive as already-parsed descriptions and candidates; outbound ones leave
//! through the injected [`SignalSender`]. Device access goes through the
//! seams in [`crate::platform`], so every path here runs under test with
//! the doubles in [`crate::testing`].

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast, mpsc};

use super::error::CallError;
use super::session::{CallDirection, CallSession, SessionPhase, SessionTransition};
use super::signal::CallKind;
use crate::config::EngineConfig;
use crate::platform::{
    AudioRouting, IceCandidate, IceConnectionState, MediaConstraints, MediaDevices, MediaStream,
    OfferOptions, PeerConnectionFactory, PeerConnectionState, PeerEvent, SessionDescription,
    TrackKind,
};

const ENGINE_EVENT_CAPACITY: usize = 100;
/// Buffered remote candidates per call before the oldest are dropped.
const PENDING_CANDIDATE_LIMIT: usize = 64;

/// Outbound signaling payloads handed to the injected [`SignalSender`].
#[derive(Debug, Clone)]
pub enum OutboundSignal {
    Offer {
        call_id: String,
        to: String,
        kind: CallKind,
        description: SessionDescription,
    },
    Answer {
        call_id: String,
        to: String,
        kind: CallKind,
        description: SessionDescription,
    },
    IceCandidate {
        call_id: String,
        to: String,
        kind: CallKind,
        candidate: IceCandidate,
    },
}

impl OutboundSignal {
    pub fn call_id(&self) -> &str {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. } => call_id,
        }
    }
}

/// Delivery seam for engine-generated signaling. The coordinator wraps
/// these into wire envelopes and publishes them on the bus.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), anyhow::Error>;
}

/// Events the engine broadcasts to observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Local capture is live; render the self-view.
    LocalStream {
        call_id: String,
        stream: Arc<MediaStream>,
    },
    /// Remote media arrived or gained a track.
    RemoteStream {
        call_id: String,
        stream: Arc<MediaStream>,
    },
    /// Media is flowing both ways.
    Connected { call_id: String },
    /// The session was torn down. Emitted exactly once per session.
    CallEnded { call_id: String },
    /// An operation or the connection itself failed.
    Error {
        call_id: Option<String>,
        message: String,
    },
}

/// Drives one call at a time over a platform peer connection.
pub struct CallEngine {
    config: EngineConfig,
    media_devices: Arc<dyn MediaDevices>,
    audio_routing: Arc<dyn AudioRouting>,
    pc_factory: Arc<dyn PeerConnectionFactory>,
    signal_sender: Arc<dyn SignalSender>,
    /// The single live session. The lock is held across setup and teardown
    /// so call operations serialize.
    session: Mutex<Option<CallSession>>,
    /// Remote candidates waiting for the remote description, keyed by call.
    pending_candidates: StdMutex<Vec<(String, IceCandidate)>>,
    /// Teardown-in-progress latch. A second end while one runs returns
    /// immediately instead of queueing behind the session lock.
    ending: AtomicBool,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl CallEngine {
    pub fn new(
        config: EngineConfig,
        media_devices: Arc<dyn MediaDevices>,
        audio_routing: Arc<dyn AudioRouting>,
        pc_factory: Arc<dyn PeerConnectionFactory>,
        signal_sender: Arc<dyn SignalSender>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Arc::new(Self {
            config,
            media_devices,
            audio_routing,
            pc_factory,
            signal_sender,
            session: Mutex::new(None),
            pending_candidates: StdMutex::new(Vec::new()),
            ending: AtomicBool::new(false),
            event_tx,
        })
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Id of the call currently holding the peer connection, if any.
    pub async fn active_call_id(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.call_id.clone())
    }

    pub async fn current_phase(&self) -> Option<SessionPhase> {
        self.session.lock().await.as_ref().map(|s| s.phase)
    }

    /// Opens an outgoing session: capture media, wire the peer connection
    /// and wait for the callee to accept. Any previous session is torn
    /// down first.
    pub async fn start_call(
        self: &Arc<Self>,
        recipient_id: &str,
        kind: CallKind,
        call_id: &str,
    ) -> Result<Arc<MediaStream>, CallError> {
        self.open_session(recipient_id, kind, call_id, CallDirection::Outgoing)
            .await
    }

    /// Opens the callee-side session for an accepted incoming call. The
    /// call id is the one the caller supplied in the ring.
    pub async fn answer_call(
        self: &Arc<Self>,
        caller_id: &str,
        kind: CallKind,
        call_id: &str,
    ) -> Result<Arc<MediaStream>, CallError> {
        self.open_session(caller_id, kind, call_id, CallDirection::Incoming)
            .await
    }

    async fn open_session(
        self: &Arc<Self>,
        peer_id: &str,
        kind: CallKind,
        call_id: &str,
        direction: CallDirection,
    ) -> Result<Arc<MediaStream>, CallError> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            info!(
                target: "Calls/Engine",
                "Replacing active call {} with {call_id}", previous.call_id
            );
            let ended = self.teardown(previous).await;
            self.emit(EngineEvent::CallEnded { call_id: ended });
        }

        if let Err(e) = self.audio_routing.start_call_audio().await {
            warn!(target: "Calls/Engine", "Could not enter call-audio mode: {e:#}");
        }

        let constraints = if kind.has_video() {
            MediaConstraints::audio_video()
        } else {
            MediaConstraints::audio_only()
        };
        let local_stream = match self.media_devices.get_user_media(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                // No session came into being; the engine stays idle.
                self.leave_call_audio().await;
                let err = CallError::MediaAcquisition(format!("{e:#}"));
                self.emit_error(Some(call_id), &err);
                return Err(err);
            }
        };

        let (pc, events) = match self.pc_factory.create_peer_connection(&self.config).await {
            Ok(pair) => pair,
            Err(e) => {
                local_stream.stop_all();
                self.leave_call_audio().await;
                let err = CallError::PeerConnection(format!("{e:#}"));
                self.emit_error(Some(call_id), &err);
                return Err(err);
            }
        };

        for track in local_stream.tracks() {
            if let Err(e) = pc.add_track(track).await {
                local_stream.stop_all();
                if let Err(e) = pc.close().await {
                    warn!(target: "Calls/Engine", "Close after failed track attach: {e:#}");
                }
                self.leave_call_audio().await;
                let err = CallError::PeerConnection(format!("{e:#}"));
                self.emit_error(Some(call_id), &err);
                return Err(err);
            }
        }

        let mut session = CallSession::new(
            call_id.to_string(),
            peer_id.to_string(),
            direction,
            kind,
            pc,
            local_stream.clone(),
        );
        session.apply_transition(SessionTransition::MediaReady)?;
        *slot = Some(session);
        drop(slot);

        self.spawn_pump(call_id.to_string(), peer_id.to_string(), events);
        self.emit(EngineEvent::LocalStream {
            call_id: call_id.to_string(),
            stream: local_stream.clone(),
        });
        info!(
            target: "Calls/Engine",
            "Session open: call={call_id} peer={peer_id} kind={kind:?} direction={direction:?}"
        );
        Ok(local_stream)
    }

    /// Builds the SDP offer, applies it locally and ships it to the peer.
    /// The initiator calls this once the callee has accepted.
    pub async fn create_and_send_offer(&self) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or_else(|| self.no_session())?;
        let options = OfferOptions {
            receive_audio: true,
            receive_video: session.kind.has_video(),
        };
        let result = async {
            let offer = session.pc.create_offer(options).await.map_err(peer_err)?;
            session
                .pc
                .set_local_description(offer.clone())
                .await
                .map_err(peer_err)?;
            self.signal_sender
                .send_signal(OutboundSignal::Offer {
                    call_id: session.call_id.clone(),
                    to: session.peer_id.clone(),
                    kind: session.kind,
                    description: offer,
                })
                .await
                .map_err(|e| CallError::Signaling(format!("{e:#}")))?;
            Ok(())
        }
        .await;
        if let Err(ref e) = result {
            self.emit_error(Some(session.call_id.as_str()), e);
        }
        result
    }

    /// Applies the remote offer, answers it and ships the answer back.
    pub async fn handle_offer(
        &self,
        call_id: &str,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or_else(|| self.no_session())?;
        if session.call_id != call_id {
            debug!(
                target: "Calls/Engine",
                "Offer for {call_id} does not match active call {}", session.call_id
            );
            return Ok(());
        }
        let result = async {
            session
                .pc
                .set_remote_description(description)
                .await
                .map_err(peer_err)?;
            self.drain_candidates(session).await;
            let answer = session.pc.create_answer().await.map_err(peer_err)?;
            session
                .pc
                .set_local_description(answer.clone())
                .await
                .map_err(peer_err)?;
            self.signal_sender
                .send_signal(OutboundSignal::Answer {
                    call_id: session.call_id.clone(),
                    to: session.peer_id.clone(),
                    kind: session.kind,
                    description: answer,
                })
                .await
                .map_err(|e| CallError::Signaling(format!("{e:#}")))?;
            Ok(())
        }
        .await;
        if let Err(ref e) = result {
            self.emit_error(Some(call_id), e);
        }
        result
    }

    /// Applies the remote answer on the initiator side.
    pub async fn handle_answer(
        &self,
        call_id: &str,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or_else(|| self.no_session())?;
        if session.call_id != call_id {
            debug!(
                target: "Calls/Engine",
                "Answer for {call_id} does not match active call {}", session.call_id
            );
            return Ok(());
        }
        let result = async {
            session
                .pc
                .set_remote_description(description)
                .await
                .map_err(peer_err)?;
            self.drain_candidates(session).await;
            Ok(())
        }
        .await;
        if let Err(ref e) = result {
            self.emit_error(Some(call_id), e);
        }
        result
    }

    /// Feeds a remote candidate in, or buffers it until the remote
    /// description lands. Empty candidates mark end-of-candidates and are
    /// dropped.
    pub async fn handle_ice_candidate(
        &self,
        call_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        if candidate.is_end_of_candidates() {
            debug!(target: "Calls/Engine", "End-of-candidates for {call_id}");
            return Ok(());
        }

        // Apply-or-buffer is decided under the session lock. Released
        // early, a drain could run between the check and the push and
        // strand the candidate in the buffer.
        let slot = self.session.lock().await;
        if let Some(session) = slot.as_ref()
            && session.call_id == call_id
            && session.pc.remote_description().await.is_some()
        {
            if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                warn!(target: "Calls/Engine", "Candidate rejected: {e:#}");
            }
            return Ok(());
        }

        let mut pending = self
            .pending_candidates
            .lock()
            .expect("lock should not be poisoned");
        let for_call = pending.iter().filter(|(id, _)| id == call_id).count();
        if for_call >= PENDING_CANDIDATE_LIMIT {
            warn!(
                target: "Calls/Engine",
                "Candidate buffer full for {call_id}, dropping"
            );
            return Ok(());
        }
        debug!(target: "Calls/Engine", "Buffering candidate for {call_id}");
        pending.push((call_id.to_string(), candidate));
        Ok(())
    }

    /// Flips the outgoing audio track. Returns the new enabled state.
    pub async fn toggle_microphone(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Audio).await
    }

    /// Flips the outgoing video track. Returns the new enabled state.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Video).await
    }

    async fn toggle_track(&self, kind: TrackKind) -> Result<bool, CallError> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or_else(|| self.no_session())?;
        match session.local_stream.first_track(kind) {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                debug!(
                    target: "Calls/Engine",
                    "{kind:?} track now {}", if enabled { "enabled" } else { "disabled" }
                );
                Ok(enabled)
            }
            None => {
                debug!(target: "Calls/Engine", "No local {kind:?} track to toggle");
                Ok(false)
            }
        }
    }

    /// Routes audio to the speakerphone or back to the earpiece. Returns
    /// the new speakerphone state.
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or_else(|| self.no_session())?;
        let target = !session.speaker_on;
        self.audio_routing
            .set_speakerphone(target)
            .await
            .map_err(|e| CallError::AudioRouting(format!("{e:#}")))?;
        session.speaker_on = target;
        Ok(target)
    }

    /// Winds the active session down: close the peer connection, stop all
    /// tracks, leave call-audio mode. Individual step failures are logged,
    /// never propagated. Without a session this is a no-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.end_session(None).await
    }

    /// Ends the session only if it is the given call, so stale failure
    /// reports for a finished call cannot kill its successor.
    pub async fn end_call_for(&self, call_id: &str) -> Result<(), CallError> {
        self.end_session(Some(call_id)).await
    }

    async fn end_session(&self, only_call: Option<&str>) -> Result<(), CallError> {
        if self.ending.swap(true, Ordering::SeqCst) {
            debug!(target: "Calls/Engine", "End already in progress");
            return Ok(());
        }
        let _reset = scopeguard::guard((), |_| {
            self.ending.store(false, Ordering::SeqCst);
        });

        let taken = {
            let mut slot = self.session.lock().await;
            match (slot.as_ref(), only_call) {
                (Some(session), Some(id)) if session.call_id != id => None,
                _ => slot.take(),
            }
        };
        let Some(session) = taken else {
            return Ok(());
        };

        let call_id = self.teardown(session).await;
        self.emit(EngineEvent::CallEnded { call_id });
        Ok(())
    }

    async fn teardown(&self, session: CallSession) -> String {
        let duration = session.duration_secs();
        let CallSession {
            call_id,
            pc,
            local_stream,
            remote_stream,
            ..
        } = session;

        if let Err(e) = pc.close().await {
            warn!(target: "Calls/Engine", "Peer connection close failed: {e:#}");
        }
        local_stream.stop_all();
        if let Some(remote) = remote_stream {
            remote.stop_all();
        }
        self.leave_call_audio().await;
        self.pending_candidates
            .lock()
            .expect("lock should not be poisoned")
            .retain(|(id, _)| id != &call_id);

        match duration {
            Some(secs) => info!(target: "Calls/Engine", "Call {call_id} over after {secs}s"),
            None => info!(target: "Calls/Engine", "Call {call_id} over before connecting"),
        }
        call_id
    }

    async fn leave_call_audio(&self) {
        if let Err(e) = self.audio_routing.stop_call_audio().await {
            warn!(target: "Calls/Engine", "Could not leave call-audio mode: {e:#}");
        }
    }

    /// Snapshot-and-clear: feed buffered candidates for this call into the
    /// peer connection in arrival order.
    async fn drain_candidates(&self, session: &CallSession) {
        let drained: Vec<IceCandidate> = {
            let mut pending = self
                .pending_candidates
                .lock()
                .expect("lock should not be poisoned");
            let mut kept = Vec::new();
            let mut matching = Vec::new();
            for (id, candidate) in std::mem::take(&mut *pending) {
                if id == session.call_id {
                    matching.push(candidate);
                } else {
                    kept.push((id, candidate));
                }
            }
            *pending = kept;
            matching
        };
        if drained.is_empty() {
            return;
        }
        debug!(
            target: "Calls/Engine",
            "Draining {} buffered candidates for {}", drained.len(), session.call_id
        );
        for candidate in drained {
            if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                warn!(target: "Calls/Engine", "Buffered candidate rejected: {e:#}");
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        call_id: String,
        peer_id: String,
        mut events: mpsc::Receiver<PeerEvent>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_peer_event(&call_id, &peer_id, event).await;
            }
            debug!(target: "Calls/Engine", "Peer event stream for {call_id} closed");
        });
    }

    async fn handle_peer_event(self: &Arc<Self>, call_id: &str, peer_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let kind = {
                    self.session
                        .lock()
                        .await
                        .as_ref()
                        .filter(|s| s.call_id == call_id)
                        .map(|s| s.kind)
                };
                let Some(kind) = kind else {
                    debug!(target: "Calls/Engine", "Local candidate for finished call {call_id}");
                    return;
                };
                let signal = OutboundSignal::IceCandidate {
                    call_id: call_id.to_string(),
                    to: peer_id.to_string(),
                    kind,
                    candidate,
                };
                if let Err(e) = self.signal_sender.send_signal(signal).await {
                    warn!(target: "Calls/Engine", "Could not deliver local candidate: {e:#}");
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let stream = {
                    let mut slot = self.session.lock().await;
                    match slot.as_mut() {
                        Some(session) if session.call_id == call_id => {
                            let stream = session
                                .remote_stream
                                .get_or_insert_with(|| MediaStream::new(format!("remote-{call_id}")))
                                .clone();
                            stream.add_track(track);
                            Some(stream)
                        }
                        _ => {
                            debug!(target: "Calls/Engine", "Remote track for finished call {call_id}");
                            None
                        }
                    }
                };
                if let Some(stream) = stream {
                    self.emit(EngineEvent::RemoteStream {
                        call_id: call_id.to_string(),
                        stream,
                    });
                }
            }
            PeerEvent::ConnectionState(state) => self.handle_connection_state(call_id, state).await,
            PeerEvent::IceConnectionState(IceConnectionState::Failed) => {
                warn!(target: "Calls/Engine", "ICE failed for {call_id}");
                self.emit(EngineEvent::Error {
                    call_id: Some(call_id.to_string()),
                    message: "ICE connection failed".to_string(),
                });
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(target: "Calls/Engine", "ICE state for {call_id}: {state:?}");
            }
        }
    }

    async fn handle_connection_state(
        self: &Arc<Self>,
        call_id: &str,
        state: PeerConnectionState,
    ) {
        match state {
            PeerConnectionState::Connected => {
                let announced = {
                    let mut slot = self.session.lock().await;
                    match slot.as_mut() {
                        Some(session) if session.call_id == call_id => {
                            let first = !session.is_connected();
                            match session.apply_transition(SessionTransition::PeerConnected) {
                                Ok(()) => first,
                                Err(e) => {
                                    warn!(
                                        target: "Calls/Engine",
                                        "Connected in unexpected phase: {e}"
                                    );
                                    false
                                }
                            }
                        }
                        _ => false,
                    }
                };
                if announced {
                    info!(target: "Calls/Engine", "Call {call_id} connected");
                    self.emit(EngineEvent::Connected {
                        call_id: call_id.to_string(),
                    });
                }
            }
            PeerConnectionState::Failed => {
                // The phase machine doubles as a latch: a second Failed
                // lands in the Failed phase and is rejected.
                let latched = {
                    let mut slot = self.session.lock().await;
                    match slot.as_mut() {
                        Some(session) if session.call_id == call_id => session
                            .apply_transition(SessionTransition::ConnectionFailed)
                            .is_ok(),
                        _ => false,
                    }
                };
                if latched {
                    warn!(target: "Calls/Engine", "Peer connection for {call_id} failed");
                    self.emit(EngineEvent::Error {
                        call_id: Some(call_id.to_string()),
                        message: "peer connection failed".to_string(),
                    });
                    let _ = self.end_call_for(call_id).await;
                }
            }
            PeerConnectionState::Disconnected => {
                debug!(target: "Calls/Engine", "Call {call_id} transport interrupted");
            }
            other => {
                debug!(target: "Calls/Engine", "Connection state for {call_id}: {other:?}");
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_error(&self, call_id: Option<&str>, error: &CallError) {
        self.emit(EngineEvent::Error {
            call_id: call_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    /// Missing-session precondition failure: observers get the event, the
    /// caller gets the error.
    fn no_session(&self) -> CallError {
        let err = CallError::NotInitialized;
        self.emit_error(None, &err);
        err
    }
}

fn peer_err(e: anyhow::Error) -> CallError {
    CallError::PeerConnection(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        MockAudioRouting, MockMediaDevices, MockPeerConnectionFactory, MockSignalSender,
    };

    fn make_engine(
        devices: Arc<MockMediaDevices>,
    ) -> (Arc<CallEngine>, Arc<MockAudioRouting>, Arc<MockPeerConnectionFactory>) {
        let audio = MockAudioRouting::new();
        let factory = MockPeerConnectionFactory::new();
        let engine = CallEngine::new(
            EngineConfig::default(),
            devices,
            audio.clone(),
            factory.clone(),
            MockSignalSender::new(),
        );
        (engine, audio, factory)
    }

    #[tokio::test]
    async fn test_media_denial_leaves_engine_idle() {
        let (engine, audio, _factory) = make_engine(MockMediaDevices::denying("permission denied"));

        let err = engine
            .start_call("peer-1", CallKind::Audio, "call-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaAcquisition(_)));
        assert!(engine.active_call_id().await.is_none());
        // Call-audio mode was entered and then left again.
        assert_eq!(audio.start_count(), 1);
        assert_eq!(audio.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_offer_without_session_is_not_initialized() {
        let (engine, _audio, _factory) = make_engine(MockMediaDevices::granting());
        assert!(matches!(
            engine.create_and_send_offer().await.unwrap_err(),
            CallError::NotInitialized
        ));
        assert!(matches!(
            engine.toggle_microphone().await.unwrap_err(),
            CallError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_end_call_without_session_is_silent() {
        let (engine, _audio, _factory) = make_engine(MockMediaDevices::granting());
        let mut events = engine.events();
        engine.end_call().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_of_candidates_marker_is_dropped() {
        let (engine, _audio, _factory) = make_engine(MockMediaDevices::granting());
        engine
            .handle_ice_candidate(
                "call-1",
                IceCandidate {
                    candidate: "  ".to_string(),
                    sdp_mline_index: None,
                    sdp_mid: None,
                },
            )
            .await
            .unwrap();
        assert!(engine.pending_candidates.lock().unwrap().is_empty());
    }
}
