//! Default peer-connection backend on the `webrtc` crate.
//!
//! The factory builds one `RTCPeerConnection` per call session and wires its
//! callbacks into an mpsc stream of [`PeerEvent`]s, so the engine consumes
//! connection activity the same way it consumes transport activity.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceCandidate, IceConnectionState, MediaTrack, OfferOptions, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerEvent, SessionDescription, TrackKind,
};
use crate::config::EngineConfig;

const PEER_EVENT_CAPACITY: usize = 100;

/// Local track backed by [`TrackLocalStaticSample`]. Host capture pipelines
/// construct one per device track and push samples through [`Self::sample_track`].
pub struct WebRtcLocalTrack {
    inner: Arc<TrackLocalStaticSample>,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        Self::with_codec(TrackKind::Audio, MIME_TYPE_OPUS, id, stream_id)
    }

    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        Self::with_codec(TrackKind::Video, MIME_TYPE_VP8, id, stream_id)
    }

    fn with_codec(
        kind: TrackKind,
        mime_type: &str,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Arc<Self> {
        let inner = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.into(),
            stream_id.into(),
        ));
        Arc::new(Self {
            inner,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    /// Handle the capture pipeline writes samples into. Writers must check
    /// [`MediaTrack::is_enabled`] before each write so mute takes effect.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.clone()
    }

    /// True once the owning session has released the track; the capture
    /// pipeline should shut down its writer.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl MediaTrack for WebRtcLocalTrack {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Remote track surfaced from `on_track`. The enabled flag is advisory;
/// renderers check it before drawing.
pub struct WebRtcRemoteTrack {
    inner: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
}

impl WebRtcRemoteTrack {
    fn new(inner: Arc<TrackRemote>) -> Arc<Self> {
        let kind = match inner.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let id = format!("remote-{}", inner.ssrc());
        Arc::new(Self {
            inner,
            id,
            kind,
            enabled: AtomicBool::new(true),
        })
    }

    /// RTP source for renderers that pull samples themselves.
    pub fn rtp_track(&self) -> Arc<TrackRemote> {
        self.inner.clone()
    }
}

impl MediaTrack for WebRtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`PeerConnectionFactory`] producing `webrtc`-crate connections.
#[derive(Default)]
pub struct WebRtcPeerConnectionFactory;

impl WebRtcPeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create_peer_connection(
        &self,
        config: &EngineConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (event_tx, event_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        wire_callbacks(&pc, event_tx);

        let connection: Arc<dyn PeerConnection> = Arc::new(WebRtcPeerConnection {
            pc,
            has_audio_sender: AtomicBool::new(false),
            has_video_sender: AtomicBool::new(false),
        });
        Ok((connection, event_rx))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, event_tx: mpsc::Sender<PeerEvent>) {
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx
                        .send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                        }))
                        .await;
                }
                Err(e) => {
                    warn!(target: "Calls/Peer", "Failed to serialize ICE candidate: {e}");
                }
            }
        })
    }));

    let tx = event_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target: "Calls/Peer", "Remote track arrived: ssrc={}", track.ssrc());
            let remote: Arc<dyn MediaTrack> = WebRtcRemoteTrack::new(track);
            let _ = tx.send(PeerEvent::RemoteTrack(remote)).await;
        })
    }));

    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx
                .send(PeerEvent::ConnectionState(map_connection_state(state)))
                .await;
        })
    }));

    let tx = event_tx;
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx
                .send(PeerEvent::IceConnectionState(map_ice_state(state)))
                .await;
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    has_audio_sender: AtomicBool,
    has_video_sender: AtomicBool,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, anyhow::Error> {
        // Receive-only media still needs a transceiver in the offer.
        if options.receive_audio && !self.has_audio_sender.load(Ordering::Acquire) {
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
        }
        if options.receive_video && !self.has_video_sender.load(Ordering::Acquire) {
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
        }
        let offer = self.pc.create_offer(None).await?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.map(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), anyhow::Error> {
        let local = track
            .as_any()
            .downcast_ref::<WebRtcLocalTrack>()
            .ok_or_else(|| anyhow::anyhow!("track was not created for the webrtc backend"))?;
        let sample_track: Arc<dyn TrackLocal + Send + Sync> = local.sample_track();
        self.pc.add_track(sample_track).await?;
        match track.kind() {
            TrackKind::Audio => self.has_audio_sender.store(true, Ordering::Release),
            TrackKind::Video => self.has_video_sender.store(true, Ordering::Release),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.pc.close().await?;
        Ok(())
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        sdp_type: desc.sdp_type.to_string(),
        sdp: desc.sdp,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, anyhow::Error> {
    match desc.sdp_type.as_str() {
        "offer" => Ok(RTCSessionDescription::offer(desc.sdp)?),
        "answer" => Ok(RTCSessionDescription::answer(desc.sdp)?),
        "pranswer" => Ok(RTCSessionDescription::pranswer(desc.sdp)?),
        other => Err(anyhow::anyhow!("unsupported sdp type: {other}")),
    }
}
