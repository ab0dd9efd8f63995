//! Test doubles for the transport and platform seams.
//!
//! Each mock records what the code under test did, lets tests script
//! failures, and injects inbound events through the same channels the real
//! implementations use. The module is public rather than `cfg(test)` so
//! the integration tests under `tests/` can reach it.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::calls::{OutboundSignal, SignalSender};
use crate::config::EngineConfig;
use crate::platform::{
    AudioRouting, IceCandidate, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    OfferOptions, PeerConnection, PeerConnectionFactory, PeerEvent, SessionDescription, TrackKind,
};
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};

const MOCK_EVENT_CAPACITY: usize = 100;

/// Recording stand-in for a broker connection.
///
/// Tests feed inbound traffic through [`MockTransport::emit`] or
/// [`MockTransport::deliver_json`] and read outbound traffic back with
/// [`MockTransport::sent_json`].
pub struct MockTransport {
    subscriptions: StdMutex<Vec<String>>,
    unsubscriptions: StdMutex<Vec<String>>,
    sent: StdMutex<Vec<(String, Vec<u8>)>>,
    disconnects: AtomicUsize,
    next_sub_id: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_send: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    fn new(events_tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            subscriptions: StdMutex::new(Vec::new()),
            unsubscriptions: StdMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            next_sub_id: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            events_tx,
        }
    }

    /// Injects a transport event as if the broker produced it.
    pub async fn emit(&self, event: TransportEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("transport event receiver dropped");
    }

    /// Delivers a JSON payload as an inbound broker message.
    pub async fn deliver_json(&self, destination: &str, payload: &Value) {
        let body = serde_json::to_vec(payload).expect("payload should serialize");
        self.emit(TransportEvent::Message {
            destination: destination.to_string(),
            body: Bytes::from(body),
        })
        .await;
    }

    /// Destinations subscribed so far, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("lock should not be poisoned")
            .len()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscriptions
            .lock()
            .expect("lock should not be poisoned")
            .len()
    }

    /// Everything sent so far as `(destination, body)` pairs.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    /// Takes and clears everything sent so far.
    pub fn drain_sent(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().expect("lock should not be poisoned"))
    }

    /// Bodies sent to one destination, parsed as JSON.
    pub fn sent_json(&self, destination: &str) -> Vec<Value> {
        self.sent
            .lock()
            .expect("lock should not be poisoned")
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, body)| serde_json::from_slice(body).expect("sent body should be JSON"))
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, destination: &str) -> Result<String, anyhow::Error> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("subscribe refused"));
        }
        self.subscriptions
            .lock()
            .expect("lock should not be poisoned")
            .push(destination.to_string());
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sub-{id}"))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), anyhow::Error> {
        self.unsubscriptions
            .lock()
            .expect("lock should not be poisoned")
            .push(subscription_id.to_string());
        Ok(())
    }

    async fn send(&self, destination: &str, body: &[u8]) -> Result<(), anyhow::Error> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("send refused"));
        }
        self.sent
            .lock()
            .expect("lock should not be poisoned")
            .push((destination.to_string(), body.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`MockTransport`]s and keeping hold of them for
/// inspection.
#[derive(Default)]
pub struct MockTransportFactory {
    transports: StdMutex<Vec<Arc<MockTransport>>>,
    fail_connect: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.transports
            .lock()
            .expect("lock should not be poisoned")
            .len()
    }

    /// The most recently created transport.
    pub fn transport(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .expect("lock should not be poisoned")
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        _params: &ConnectParams,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connect refused"));
        }
        let (events_tx, events_rx) = mpsc::channel(MOCK_EVENT_CAPACITY);
        let transport = Arc::new(MockTransport::new(events_tx));
        self.transports
            .lock()
            .expect("lock should not be poisoned")
            .push(transport.clone());
        Ok((transport, events_rx))
    }
}

/// In-memory media track. Also the track type [`MockMediaDevices`] puts in
/// its streams.
pub struct MockMediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockMediaTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockMediaTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture seam double. `granting` hands out streams with one mock track
/// per requested kind; `denying` fails every request, like a user refusing
/// the permission prompt.
pub struct MockMediaDevices {
    denial: Option<String>,
    requests: StdMutex<Vec<MediaConstraints>>,
    next_stream_id: AtomicUsize,
}

impl MockMediaDevices {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            denial: None,
            requests: StdMutex::new(Vec::new()),
            next_stream_id: AtomicUsize::new(0),
        })
    }

    pub fn denying(message: &str) -> Arc<Self> {
        Arc::new(Self {
            denial: Some(message.to_string()),
            requests: StdMutex::new(Vec::new()),
            next_stream_id: AtomicUsize::new(0),
        })
    }

    /// The constraints of every `get_user_media` call so far.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaStream>, anyhow::Error> {
        self.requests
            .lock()
            .expect("lock should not be poisoned")
            .push(*constraints);
        if let Some(message) = &self.denial {
            return Err(anyhow::anyhow!("{message}"));
        }
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(MockMediaTrack::new("mock-audio", TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MockMediaTrack::new("mock-video", TrackKind::Video));
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::with_tracks(format!("mock-stream-{id}"), tracks))
    }
}

/// Audio routing double counting mode switches and speakerphone flips.
pub struct MockAudioRouting {
    starts: AtomicUsize,
    stops: AtomicUsize,
    speaker_settings: StdMutex<Vec<bool>>,
    fail_speakerphone: AtomicBool,
}

impl MockAudioRouting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            speaker_settings: StdMutex::new(Vec::new()),
            fail_speakerphone: AtomicBool::new(false),
        })
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Every value passed to `set_speakerphone`, in order.
    pub fn speaker_settings(&self) -> Vec<bool> {
        self.speaker_settings
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn set_fail_speakerphone(&self, fail: bool) {
        self.fail_speakerphone.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioRouting for MockAudioRouting {
    async fn start_call_audio(&self) -> Result<(), anyhow::Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_call_audio(&self) -> Result<(), anyhow::Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_speakerphone(&self, enabled: bool) -> Result<(), anyhow::Error> {
        if self.fail_speakerphone.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("audio route unavailable"));
        }
        self.speaker_settings
            .lock()
            .expect("lock should not be poisoned")
            .push(enabled);
        Ok(())
    }
}

/// Peer connection double. Descriptions and candidates are recorded;
/// events are injected with [`MockPeerConnection::push_event`] and arrive
/// at the engine through the same channel a real backend would use.
pub struct MockPeerConnection {
    offer_requests: StdMutex<Vec<OfferOptions>>,
    local_descriptions: StdMutex<Vec<SessionDescription>>,
    remote: StdMutex<Option<SessionDescription>>,
    candidates: StdMutex<Vec<IceCandidate>>,
    added_tracks: StdMutex<Vec<String>>,
    closes: AtomicUsize,
    fail_offer: AtomicBool,
    fail_answer: AtomicBool,
    fail_remote_description: AtomicBool,
    fail_candidate: AtomicBool,
    fail_track: AtomicBool,
    events_tx: mpsc::Sender<PeerEvent>,
}

impl MockPeerConnection {
    pub fn create() -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(MOCK_EVENT_CAPACITY);
        let pc = Arc::new(Self {
            offer_requests: StdMutex::new(Vec::new()),
            local_descriptions: StdMutex::new(Vec::new()),
            remote: StdMutex::new(None),
            candidates: StdMutex::new(Vec::new()),
            added_tracks: StdMutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_offer: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
            fail_candidate: AtomicBool::new(false),
            fail_track: AtomicBool::new(false),
            events_tx,
        });
        (pc, events_rx)
    }

    /// Injects a peer event as if the underlying connection produced it.
    pub async fn push_event(&self, event: PeerEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("peer event receiver dropped");
    }

    /// The options of every `create_offer` call so far.
    pub fn offer_requests(&self) -> Vec<OfferOptions> {
        self.offer_requests
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    /// Sync view of the stored remote description.
    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    /// Candidates accepted through `add_ice_candidate`, in arrival order.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.added_tracks
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_offer(&self, fail: bool) {
        self.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_answer(&self, fail: bool) {
        self.fail_answer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remote_description(&self, fail: bool) {
        self.fail_remote_description.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_candidate(&self, fail: bool) {
        self.fail_candidate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_track(&self, fail: bool) {
        self.fail_track.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, anyhow::Error> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("offer refused"));
        }
        self.offer_requests
            .lock()
            .expect("lock should not be poisoned")
            .push(options);
        Ok(SessionDescription::offer("v=0\r\nmock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("answer refused"));
        }
        Ok(SessionDescription::answer("v=0\r\nmock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error> {
        self.local_descriptions
            .lock()
            .expect("lock should not be poisoned")
            .push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error> {
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("remote description refused"));
        }
        *self.remote.lock().expect("lock should not be poisoned") = Some(desc);
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        if self.fail_candidate.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("candidate refused"));
        }
        self.candidates
            .lock()
            .expect("lock should not be poisoned")
            .push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), anyhow::Error> {
        if self.fail_track.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("track refused"));
        }
        self.added_tracks
            .lock()
            .expect("lock should not be poisoned")
            .push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`MockPeerConnection`]s and keeping hold of them for
/// inspection and event injection.
pub struct MockPeerConnectionFactory {
    connections: StdMutex<Vec<Arc<MockPeerConnection>>>,
    fail_create: AtomicBool,
}

impl MockPeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn create_count(&self) -> usize {
        self.connections
            .lock()
            .expect("lock should not be poisoned")
            .len()
    }

    /// The most recently created connection.
    pub fn last_connection(&self) -> Arc<MockPeerConnection> {
        self.connections
            .lock()
            .expect("lock should not be poisoned")
            .last()
            .cloned()
            .expect("no peer connection created yet")
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create_peer_connection(
        &self,
        _config: &EngineConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("peer connection refused"));
        }
        let (pc, events_rx) = MockPeerConnection::create();
        self.connections
            .lock()
            .expect("lock should not be poisoned")
            .push(pc.clone());
        Ok((pc, events_rx))
    }
}

/// Signal delivery double recording everything the engine sends out.
pub struct MockSignalSender {
    sent: StdMutex<Vec<OutboundSignal>>,
    fail: AtomicBool,
}

impl MockSignalSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: StdMutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalSender for MockSignalSender {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("signal send refused"));
        }
        self.sent
            .lock()
            .expect("lock should not be poisoned")
            .push(signal);
        Ok(())
    }
}
