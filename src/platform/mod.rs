//! Platform media seams for call sessions.
//!
//! The call engine never touches device APIs directly. A host shell supplies
//! capture through [`MediaDevices`] and audio routing through [`AudioRouting`],
//! and a peer-connection backend through [`PeerConnectionFactory`]. The
//! [`webrtc`] submodule carries the default backend; test doubles live in
//! [`crate::testing`].

pub mod webrtc;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::EngineConfig;

/// Session description in the shape it crosses the wire: a lowercase
/// `type` tag plus the raw SDP text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate init fields as produced by `onicecandidate` on either end.
///
/// Field names follow the W3C dictionary, `sdpMLineIndex` capital L included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    /// An empty candidate string is the end-of-candidates marker.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Which tracks `get_user_media` should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single captured or received media track.
///
/// `as_any` lets a backend recover its concrete track type when the engine
/// hands tracks back through [`PeerConnection::add_track`].
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    /// Pause or resume the track without tearing it down.
    fn set_enabled(&self, enabled: bool);
    /// Release the underlying capture resource. Idempotent.
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

/// A bundle of tracks sharing one lifetime, mirroring the `MediaStream`
/// object the signaling payloads were designed around.
pub struct MediaStream {
    id: String,
    tracks: RwLock<Vec<Arc<dyn MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_tracks(id, Vec::new())
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: RwLock::new(tracks),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&self, track: Arc<dyn MediaTrack>) {
        self.tracks
            .write()
            .expect("lock should not be poisoned")
            .push(track);
    }

    /// Snapshot of the current tracks.
    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks
            .read()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks
            .read()
            .expect("lock should not be poisoned")
            .iter()
            .find(|track| track.kind() == kind)
            .cloned()
    }

    /// Stop every track. Runs on a snapshot so a `stop` implementation may
    /// call back into the stream without deadlocking.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks().len())
            .finish()
    }
}

/// Device capture seam, the `getUserMedia` analogue. Supplied by the host.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaStream>, anyhow::Error>;
}

/// Call-audio routing seam. Speakerphone switching and the platform
/// call-audio mode live behind this.
#[async_trait]
pub trait AudioRouting: Send + Sync {
    async fn start_call_audio(&self) -> Result<(), anyhow::Error>;
    async fn stop_call_audio(&self) -> Result<(), anyhow::Error>;
    async fn set_speakerphone(&self, enabled: bool) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Events a peer connection pushes back to the engine.
pub enum PeerEvent {
    /// The local agent gathered a candidate that must reach the remote peer.
    IceCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteTrack(Arc<dyn MediaTrack>),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(candidate) => f.debug_tuple("IceCandidate").field(candidate).finish(),
            Self::RemoteTrack(track) => f
                .debug_struct("RemoteTrack")
                .field("id", &track.id())
                .field("kind", &track.kind())
                .finish(),
            Self::ConnectionState(state) => f.debug_tuple("ConnectionState").field(state).finish(),
            Self::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
        }
    }
}

/// Options applied when the engine creates an offer.
#[derive(Debug, Clone, Copy)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

/// One WebRTC peer connection, behind a seam so tests run without a
/// network stack.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, anyhow::Error>;
    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error>;
    /// `None` until `set_remote_description` has succeeded.
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), anyhow::Error>;
    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Produces wired peer-connection/event-stream pairs, mirroring
/// [`crate::transport::TransportFactory`].
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &EngineConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}
