//! Call engine negotiation paths over mock platform seams: offer/answer,
//! candidate buffering, teardown and connection failure handling.

use std::sync::Arc;
use std::time::Duration;

use ridewire::calls::{CallEngine, CallError, CallKind, EngineEvent, OutboundSignal};
use ridewire::config::EngineConfig;
use ridewire::platform::{
    IceCandidate, IceConnectionState, MediaConstraints, PeerConnectionState, PeerEvent,
    SessionDescription, TrackKind,
};
use ridewire::testing::{
    MockAudioRouting, MockMediaDevices, MockMediaTrack, MockPeerConnectionFactory,
    MockSignalSender,
};
use tokio::sync::broadcast;

struct Harness {
    engine: Arc<CallEngine>,
    devices: Arc<MockMediaDevices>,
    audio: Arc<MockAudioRouting>,
    factory: Arc<MockPeerConnectionFactory>,
    sender: Arc<MockSignalSender>,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let devices = MockMediaDevices::granting();
    let audio = MockAudioRouting::new();
    let factory = MockPeerConnectionFactory::new();
    let sender = MockSignalSender::new();
    let engine = CallEngine::new(
        EngineConfig::default(),
        devices.clone(),
        audio.clone(),
        factory.clone(),
        sender.clone(),
    );
    Harness {
        engine,
        devices,
        audio,
        factory,
        sender,
    }
}

async fn recv_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("engine event stream closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{tag} 1 udp 2122260223 10.0.0.2 54400 typ host"),
        sdp_mline_index: Some(0),
        sdp_mid: Some("0".to_string()),
    }
}

#[tokio::test]
async fn test_outgoing_video_call_full_negotiation() {
    let h = harness();
    let mut events = h.engine.events();

    let local = h
        .engine
        .start_call("peer-2", CallKind::Video, "call-1")
        .await
        .unwrap();
    assert_eq!(h.devices.requests(), vec![MediaConstraints::audio_video()]);
    assert_eq!(local.tracks().len(), 2);

    let pc = h.factory.last_connection();
    assert_eq!(pc.added_tracks(), vec!["mock-audio", "mock-video"]);
    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::LocalStream { ref call_id, .. } if call_id == "call-1"
    ));

    // Callee accepted; the initiator builds and ships the offer.
    h.engine.create_and_send_offer().await.unwrap();
    assert_eq!(pc.local_descriptions()[0].sdp_type, "offer");
    assert!(pc.offer_requests()[0].receive_video);
    match &h.sender.sent()[0] {
        OutboundSignal::Offer {
            call_id,
            to,
            kind,
            description,
        } => {
            assert_eq!(call_id, "call-1");
            assert_eq!(to, "peer-2");
            assert_eq!(*kind, CallKind::Video);
            assert_eq!(description.sdp_type, "offer");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    h.engine
        .handle_answer("call-1", SessionDescription::answer("v=0\r\nremote"))
        .await
        .unwrap();
    assert_eq!(pc.remote().unwrap().sdp_type, "answer");

    pc.push_event(PeerEvent::ConnectionState(PeerConnectionState::Connected))
        .await;
    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::Connected { ref call_id } if call_id == "call-1"
    ));

    h.engine.end_call().await.unwrap();
    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::CallEnded { ref call_id } if call_id == "call-1"
    ));
    assert_eq!(pc.close_count(), 1);
    assert_eq!(h.audio.start_count(), 1);
    assert_eq!(h.audio.stop_count(), 1);
    let track = local.first_track(TrackKind::Audio).unwrap();
    let mock = track
        .as_any()
        .downcast_ref::<MockMediaTrack>()
        .expect("track should be the mock type");
    assert!(mock.is_stopped());
    assert!(h.engine.active_call_id().await.is_none());
}

#[tokio::test]
async fn test_incoming_call_answers_remote_offer() {
    let h = harness();
    h.engine
        .answer_call("caller-1", CallKind::Audio, "call-7")
        .await
        .unwrap();
    assert_eq!(h.devices.requests(), vec![MediaConstraints::audio_only()]);

    h.engine
        .handle_offer("call-7", SessionDescription::offer("v=0\r\ncaller"))
        .await
        .unwrap();

    let pc = h.factory.last_connection();
    assert_eq!(pc.remote().unwrap().sdp_type, "offer");
    assert_eq!(pc.local_descriptions()[0].sdp_type, "answer");
    match &h.sender.sent()[0] {
        OutboundSignal::Answer { call_id, to, .. } => {
            assert_eq!(call_id, "call-7");
            assert_eq!(to, "caller-1");
        }
        other => panic!("expected answer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_candidates_buffer_until_remote_description() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let pc = h.factory.last_connection();

    h.engine
        .handle_ice_candidate("call-1", candidate("one"))
        .await
        .unwrap();
    h.engine
        .handle_ice_candidate("call-1", candidate("two"))
        .await
        .unwrap();
    assert!(pc.candidates().is_empty(), "no remote description yet");

    h.engine
        .handle_answer("call-1", SessionDescription::answer("v=0"))
        .await
        .unwrap();
    let drained = pc.candidates();
    assert_eq!(drained.len(), 2);
    assert!(drained[0].candidate.contains("one"));
    assert!(drained[1].candidate.contains("two"));

    // With the remote description in place candidates apply directly.
    h.engine
        .handle_ice_candidate("call-1", candidate("three"))
        .await
        .unwrap();
    assert_eq!(pc.candidates().len(), 3);
}

#[tokio::test]
async fn test_buffered_candidates_for_other_calls_stay_put() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();

    h.engine
        .handle_ice_candidate("some-other-call", candidate("stray"))
        .await
        .unwrap();
    h.engine
        .handle_answer("call-1", SessionDescription::answer("v=0"))
        .await
        .unwrap();

    assert!(h.factory.last_connection().candidates().is_empty());
}

#[tokio::test]
async fn test_candidates_racing_the_answer_still_apply() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let pc = h.factory.last_connection();

    let answering = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .handle_answer("call-1", SessionDescription::answer("v=0"))
                .await
                .unwrap();
        })
    };
    let mut feeders = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        feeders.push(tokio::spawn(async move {
            engine
                .handle_ice_candidate("call-1", candidate(&format!("c{i}")))
                .await
                .unwrap();
        }));
    }
    answering.await.unwrap();
    for feeder in feeders {
        feeder.await.unwrap();
    }

    // However the calls interleave, every candidate either lands in the
    // buffer before the drain or applies directly once the remote
    // description is in place. None may be stranded.
    assert_eq!(pc.candidates().len(), 8);
}

#[tokio::test]
async fn test_new_call_replaces_active_session() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let first_pc = h.factory.last_connection();
    let mut events = h.engine.events();

    h.engine
        .start_call("peer-3", CallKind::Audio, "call-2")
        .await
        .unwrap();

    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::CallEnded { ref call_id } if call_id == "call-1"
    ));
    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::LocalStream { ref call_id, .. } if call_id == "call-2"
    ));
    assert_eq!(h.factory.create_count(), 2);
    assert_eq!(first_pc.close_count(), 1);
    assert_eq!(h.engine.active_call_id().await.as_deref(), Some("call-2"));
}

#[tokio::test]
async fn test_concurrent_end_calls_emit_one_call_ended() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let mut events = h.engine.events();

    let (a, b, c, d) = tokio::join!(
        h.engine.end_call(),
        h.engine.end_call(),
        h.engine.end_call(),
        h.engine.end_call(),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    d.unwrap();
    h.engine.end_call().await.unwrap();

    let mut ended = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::CallEnded { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);
    assert_eq!(h.factory.last_connection().close_count(), 1);
}

#[tokio::test]
async fn test_connection_failure_reports_and_ends_call() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let mut events = h.engine.events();

    h.factory
        .last_connection()
        .push_event(PeerEvent::ConnectionState(PeerConnectionState::Failed))
        .await;

    match recv_event(&mut events).await {
        EngineEvent::Error { call_id, message } => {
            assert_eq!(call_id.as_deref(), Some("call-1"));
            assert!(message.contains("peer connection failed"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        recv_event(&mut events).await,
        EngineEvent::CallEnded { ref call_id } if call_id == "call-1"
    ));
    assert!(h.engine.active_call_id().await.is_none());
}

#[tokio::test]
async fn test_ice_failure_reports_without_ending_call() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let mut events = h.engine.events();

    h.factory
        .last_connection()
        .push_event(PeerEvent::IceConnectionState(IceConnectionState::Failed))
        .await;

    match recv_event(&mut events).await {
        EngineEvent::Error { call_id, message } => {
            assert_eq!(call_id.as_deref(), Some("call-1"));
            assert!(message.contains("ICE"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    // The ICE report alone must not tear the session down.
    assert_eq!(h.engine.active_call_id().await.as_deref(), Some("call-1"));
}

#[tokio::test]
async fn test_local_candidates_leave_with_call_metadata() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();

    h.factory
        .last_connection()
        .push_event(PeerEvent::IceCandidate(candidate("local")))
        .await;

    let sender = h.sender.clone();
    wait_until(move || !sender.sent().is_empty()).await;
    match &h.sender.sent()[0] {
        OutboundSignal::IceCandidate {
            call_id,
            to,
            kind,
            candidate,
        } => {
            assert_eq!(call_id, "call-1");
            assert_eq!(to, "peer-2");
            assert_eq!(*kind, CallKind::Audio);
            assert!(candidate.candidate.contains("local"));
        }
        other => panic!("expected candidate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_track_grows_remote_stream() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Video, "call-1")
        .await
        .unwrap();
    let mut events = h.engine.events();

    let pc = h.factory.last_connection();
    pc.push_event(PeerEvent::RemoteTrack(MockMediaTrack::new(
        "remote-audio",
        TrackKind::Audio,
    )))
    .await;
    pc.push_event(PeerEvent::RemoteTrack(MockMediaTrack::new(
        "remote-video",
        TrackKind::Video,
    )))
    .await;

    let first = recv_event(&mut events).await;
    match first {
        EngineEvent::RemoteStream { ref call_id, ref stream } => {
            assert_eq!(call_id, "call-1");
            assert_eq!(stream.id(), "remote-call-1");
        }
        other => panic!("expected remote stream, got {other:?}"),
    }
    match recv_event(&mut events).await {
        EngineEvent::RemoteStream { stream, .. } => {
            assert_eq!(stream.tracks().len(), 2);
            assert!(stream.first_track(TrackKind::Video).is_some());
        }
        other => panic!("expected remote stream, got {other:?}"),
    }
}

#[tokio::test]
async fn test_toggles_flip_tracks_and_speaker() {
    let h = harness();
    let local = h
        .engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();

    assert!(!h.engine.toggle_microphone().await.unwrap());
    assert!(!local.first_track(TrackKind::Audio).unwrap().is_enabled());
    assert!(h.engine.toggle_microphone().await.unwrap());
    assert!(local.first_track(TrackKind::Audio).unwrap().is_enabled());

    // Audio-only call: no camera to flip.
    assert!(!h.engine.toggle_camera().await.unwrap());

    assert!(h.engine.toggle_speaker().await.unwrap());
    assert!(!h.engine.toggle_speaker().await.unwrap());
    assert_eq!(h.audio.speaker_settings(), vec![true, false]);
}

#[tokio::test]
async fn test_signals_for_mismatched_call_are_ignored() {
    let h = harness();
    h.engine
        .start_call("peer-2", CallKind::Audio, "call-1")
        .await
        .unwrap();
    let pc = h.factory.last_connection();

    h.engine
        .handle_offer("wrong-call", SessionDescription::offer("v=0"))
        .await
        .unwrap();
    h.engine
        .handle_answer("wrong-call", SessionDescription::answer("v=0"))
        .await
        .unwrap();

    assert!(pc.remote().is_none());
    assert!(h.sender.sent().is_empty());
    assert_eq!(h.engine.active_call_id().await.as_deref(), Some("call-1"));
}

#[tokio::test]
async fn test_precondition_failures_are_emitted_and_returned() {
    let h = harness();
    let mut events = h.engine.events();

    assert!(matches!(
        h.engine.create_and_send_offer().await.unwrap_err(),
        CallError::NotInitialized
    ));
    assert!(matches!(
        h.engine
            .handle_offer("call-1", SessionDescription::offer("v=0"))
            .await
            .unwrap_err(),
        CallError::NotInitialized
    ));
    assert!(matches!(
        h.engine
            .handle_answer("call-1", SessionDescription::answer("v=0"))
            .await
            .unwrap_err(),
        CallError::NotInitialized
    ));
    assert!(matches!(
        h.engine.toggle_microphone().await.unwrap_err(),
        CallError::NotInitialized
    ));
    assert!(matches!(
        h.engine.toggle_speaker().await.unwrap_err(),
        CallError::NotInitialized
    ));

    // Every refused operation is also visible to observers, not just to
    // the direct caller.
    for _ in 0..5 {
        match recv_event(&mut events).await {
            EngineEvent::Error { call_id, message } => {
                assert!(call_id.is_none());
                assert!(message.contains("no active peer connection"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }
    assert!(events.try_recv().is_err(), "no further events expected");
}
