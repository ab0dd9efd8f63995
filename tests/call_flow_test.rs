//! End-to-end call flows: two complete stacks (bus, engine, coordinator)
//! wired back to back by pumping each mock transport's outbound traffic
//! into the other side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ridewire::bus::{Identity, Multiplexer};
use ridewire::calls::{
    BusSignalSender, CallCoordinator, CallEngine, CallKind, CallState, CoordinatorEvent, EndReason,
};
use ridewire::config::EngineConfig;
use ridewire::platform::{PeerConnectionState, PeerEvent};
use ridewire::testing::{
    MockAudioRouting, MockMediaDevices, MockPeerConnectionFactory, MockTransportFactory,
};
use ridewire::transport::TransportEvent;
use serde_json::json;
use tokio::sync::broadcast;

struct Party {
    user_id: String,
    transport_factory: Arc<MockTransportFactory>,
    mux: Arc<Multiplexer>,
    devices: Arc<MockMediaDevices>,
    audio: Arc<MockAudioRouting>,
    pc_factory: Arc<MockPeerConnectionFactory>,
    engine: Arc<CallEngine>,
    coordinator: Arc<CallCoordinator>,
}

async fn make_party(user_id: &str, first_name: &str, last_name: &str) -> Party {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport_factory = Arc::new(MockTransportFactory::new());
    let mux = Multiplexer::new(transport_factory.clone());
    mux.connect(
        "wss://broker.test/ws",
        Identity {
            user_id: user_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        },
        "jwt",
    )
    .await
    .expect("connect should succeed");

    let devices = MockMediaDevices::granting();
    let audio = MockAudioRouting::new();
    let pc_factory = MockPeerConnectionFactory::new();
    let engine = CallEngine::new(
        EngineConfig::default(),
        devices.clone(),
        audio.clone(),
        pc_factory.clone(),
        BusSignalSender::new(mux.clone()),
    );
    let coordinator = CallCoordinator::new(mux.clone(), engine.clone());
    coordinator.start().await.expect("coordinator should start");

    Party {
        user_id: user_id.to_string(),
        transport_factory,
        mux,
        devices,
        audio,
        pc_factory,
        engine,
        coordinator,
    }
}

/// Moves every queued outbound message to the transport of the party its
/// destination names. Returns whether anything moved.
async fn route(from: &Party, parties: &[&Party]) -> bool {
    let mut moved = false;
    for (destination, body) in from.transport_factory.transport().drain_sent() {
        moved = true;
        for party in parties {
            if destination.starts_with(&format!("/user/{}/", party.user_id)) {
                party
                    .transport_factory
                    .transport()
                    .emit(TransportEvent::Message {
                        destination: destination.clone(),
                        body: Bytes::from(body.clone()),
                    })
                    .await;
            }
        }
    }
    moved
}

/// Pumps the wire until three consecutive rounds move nothing.
async fn pump_wire(parties: &[&Party]) {
    let mut quiet = 0;
    for _ in 0..100 {
        let mut moved = false;
        for party in parties {
            if route(party, parties).await {
                moved = true;
            }
        }
        if moved {
            quiet = 0;
        } else {
            quiet += 1;
            if quiet >= 3 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("wire did not settle within 100 rounds");
}

async fn next_matching(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    what: &str,
    predicate: impl Fn(&CoordinatorEvent) -> bool,
) -> CoordinatorEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed while waiting for {what}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn test_full_video_call_between_two_parties() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    let bob = make_party("bob", "Bob", "Lee").await;
    let parties = [&alice, &bob];
    let mut alice_events = alice.coordinator.events();
    let mut bob_events = bob.coordinator.events();

    let call_id = alice
        .coordinator
        .place_call("bob", CallKind::Video)
        .await
        .unwrap();
    pump_wire(&parties).await;

    // Bob rings with the caller's name attached.
    let ring = next_matching(&mut bob_events, "incoming call", |e| {
        matches!(e, CoordinatorEvent::IncomingCall { .. })
    })
    .await;
    match ring {
        CoordinatorEvent::IncomingCall {
            call_id: ringing_id,
            caller_id,
            caller_first_name,
            kind,
            ..
        } => {
            assert_eq!(ringing_id, call_id);
            assert_eq!(caller_id, "alice");
            assert_eq!(caller_first_name.as_deref(), Some("Alice"));
            assert_eq!(kind, CallKind::Video);
        }
        other => panic!("expected incoming call, got {other:?}"),
    }

    // Accept rolls through CALL_ACCEPTED -> OFFER -> ANSWER.
    bob.coordinator.accept_call().await.unwrap();
    pump_wire(&parties).await;

    let bob_pc = bob.pc_factory.last_connection();
    let alice_pc = alice.pc_factory.last_connection();
    assert_eq!(bob_pc.remote().unwrap().sdp_type, "offer");
    assert_eq!(alice_pc.remote().unwrap().sdp_type, "answer");

    // Trickle one candidate each way; both land directly because the
    // remote descriptions are in place.
    alice_pc
        .push_event(PeerEvent::IceCandidate(ridewire::platform::IceCandidate {
            candidate: "candidate:a 1 udp 1 10.0.0.2 1 typ host".to_string(),
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".to_string()),
        }))
        .await;
    bob_pc
        .push_event(PeerEvent::IceCandidate(ridewire::platform::IceCandidate {
            candidate: "candidate:b 1 udp 1 10.0.0.3 1 typ host".to_string(),
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".to_string()),
        }))
        .await;
    pump_wire(&parties).await;
    assert_eq!(bob_pc.candidates().len(), 1);
    assert_eq!(alice_pc.candidates().len(), 1);

    alice_pc
        .push_event(PeerEvent::ConnectionState(PeerConnectionState::Connected))
        .await;
    bob_pc
        .push_event(PeerEvent::ConnectionState(PeerConnectionState::Connected))
        .await;
    next_matching(&mut alice_events, "caller connected", |e| {
        matches!(e, CoordinatorEvent::CallConnected { .. })
    })
    .await;
    next_matching(&mut bob_events, "callee connected", |e| {
        matches!(e, CoordinatorEvent::CallConnected { .. })
    })
    .await;

    // Alice hangs up; Bob is told and both sides wind down.
    alice.coordinator.hang_up().await.unwrap();
    pump_wire(&parties).await;

    match next_matching(&mut alice_events, "caller call ended", |e| {
        matches!(e, CoordinatorEvent::CallEnded { .. })
    })
    .await
    {
        CoordinatorEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::HungUp),
        _ => unreachable!(),
    }
    match next_matching(&mut bob_events, "callee call ended", |e| {
        matches!(e, CoordinatorEvent::CallEnded { .. })
    })
    .await
    {
        CoordinatorEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::RemoteEnded),
        _ => unreachable!(),
    }

    assert!(alice.engine.active_call_id().await.is_none());
    assert!(bob.engine.active_call_id().await.is_none());
    assert!(matches!(
        alice.coordinator.current_state().await,
        CallState::Idle
    ));
    assert!(matches!(
        bob.coordinator.current_state().await,
        CallState::Idle
    ));
    assert_eq!(alice.audio.start_count(), 1);
    assert_eq!(alice.audio.stop_count(), 1);
    assert_eq!(bob.audio.start_count(), 1);
    assert_eq!(bob.audio.stop_count(), 1);
}

#[tokio::test]
async fn test_rejected_call_ends_on_both_sides() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    let bob = make_party("bob", "Bob", "Lee").await;
    let parties = [&alice, &bob];
    let mut alice_events = alice.coordinator.events();
    let mut bob_events = bob.coordinator.events();

    alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    pump_wire(&parties).await;
    next_matching(&mut bob_events, "incoming call", |e| {
        matches!(e, CoordinatorEvent::IncomingCall { .. })
    })
    .await;

    bob.coordinator.reject_call().await.unwrap();
    pump_wire(&parties).await;

    match next_matching(&mut bob_events, "declined locally", |e| {
        matches!(e, CoordinatorEvent::CallEnded { .. })
    })
    .await
    {
        CoordinatorEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Declined),
        _ => unreachable!(),
    }
    match next_matching(&mut alice_events, "rejected remotely", |e| {
        matches!(e, CoordinatorEvent::CallEnded { .. })
    })
    .await
    {
        CoordinatorEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Rejected),
        _ => unreachable!(),
    }

    // The callee never brought a peer connection up.
    assert_eq!(bob.pc_factory.create_count(), 0);
    assert!(alice.engine.active_call_id().await.is_none());
}

#[tokio::test]
async fn test_cancel_while_ringing_clears_callee() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    let bob = make_party("bob", "Bob", "Lee").await;
    let parties = [&alice, &bob];
    let mut bob_events = bob.coordinator.events();

    alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    pump_wire(&parties).await;
    next_matching(&mut bob_events, "incoming call", |e| {
        matches!(e, CoordinatorEvent::IncomingCall { .. })
    })
    .await;

    // Unanswered outgoing call: hang-up goes out as CALL_CANCELLED.
    alice.coordinator.hang_up().await.unwrap();
    pump_wire(&parties).await;

    match next_matching(&mut bob_events, "ring withdrawn", |e| {
        matches!(e, CoordinatorEvent::CallEnded { .. })
    })
    .await
    {
        CoordinatorEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Cancelled),
        _ => unreachable!(),
    }
    assert!(matches!(
        bob.coordinator.current_state().await,
        CallState::Idle
    ));
    assert_eq!(bob.pc_factory.create_count(), 0);
}

#[tokio::test]
async fn test_busy_callee_ignores_second_ring() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    let bob = make_party("bob", "Bob", "Lee").await;
    let carol = make_party("carol", "Carol", "Diaz").await;
    let parties = [&alice, &bob, &carol];
    let mut bob_events = bob.coordinator.events();

    let first_call = alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    pump_wire(&parties).await;
    next_matching(&mut bob_events, "incoming call", |e| {
        matches!(e, CoordinatorEvent::IncomingCall { .. })
    })
    .await;

    carol
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    pump_wire(&parties).await;

    // Bob still rings for the first call only; the second request went
    // nowhere.
    match bob.coordinator.current_state().await {
        CallState::IncomingRinging(ringing) => {
            assert_eq!(ringing.call_id, first_call);
            assert_eq!(ringing.caller_id, "alice");
        }
        other => panic!("expected ringing, got {other:?}"),
    }
    assert!(matches!(
        carol.coordinator.current_state().await,
        CallState::Active(_)
    ));
}

#[tokio::test]
async fn test_forged_signals_with_wrong_call_id_are_discarded() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    let bob = make_party("bob", "Bob", "Lee").await;
    let parties = [&alice, &bob];
    let mut bob_events = bob.coordinator.events();

    alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    pump_wire(&parties).await;
    next_matching(&mut bob_events, "incoming call", |e| {
        matches!(e, CoordinatorEvent::IncomingCall { .. })
    })
    .await;
    bob.coordinator.accept_call().await.unwrap();
    pump_wire(&parties).await;

    let bob_pc = bob.pc_factory.last_connection();
    let legit_offer = bob_pc.remote().expect("negotiation should have run");
    let candidates_before = bob_pc.candidates().len();

    let transport = bob.transport_factory.transport();
    transport
        .deliver_json(
            "/user/bob/queue/call",
            &json!({
                "type": "OFFER",
                "callerId": "mallory",
                "recipientId": "bob",
                "callType": "AUDIO",
                "callId": "999-deadbeef",
                "offer": {"type": "offer", "sdp": "v=0\r\nforged"}
            }),
        )
        .await;
    transport
        .deliver_json(
            "/user/bob/queue/call",
            &json!({
                "type": "ICE_CANDIDATE",
                "callerId": "mallory",
                "recipientId": "bob",
                "callType": "AUDIO",
                "callId": "999-deadbeef",
                "candidate": {"candidate": "candidate:evil 1 udp 1 6.6.6.6 1 typ host"}
            }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bob_pc.remote().unwrap(), legit_offer);
    assert_eq!(bob_pc.candidates().len(), candidates_before);
    assert!(matches!(
        bob.coordinator.current_state().await,
        CallState::Active(_)
    ));
}

#[tokio::test]
async fn test_call_request_wire_shape() {
    let alice = make_party("alice", "Alice", "Ramsey").await;

    let call_id = alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap();
    assert_eq!(
        alice.devices.requests(),
        vec![ridewire::platform::MediaConstraints::audio_only()]
    );

    let sent = alice
        .transport_factory
        .transport()
        .sent_json("/user/bob/queue/call");
    assert_eq!(sent.len(), 1);
    let request = &sent[0];
    assert_eq!(request["type"], "CALL_REQUEST");
    assert_eq!(request["callerId"], "alice");
    assert_eq!(request["recipientId"], "bob");
    assert_eq!(request["callType"], "AUDIO");
    assert_eq!(request["callId"], call_id.as_str());
    assert_eq!(request["callerFirstName"], "Alice");
    assert_eq!(request["callerLastName"], "Ramsey");
    assert!(request.get("offer").is_none());
    assert!(request.get("candidate").is_none());
}

#[tokio::test]
async fn test_place_call_while_disconnected_fails() {
    let alice = make_party("alice", "Alice", "Ramsey").await;
    alice.mux.disconnect().await;

    let err = alice
        .coordinator
        .place_call("bob", CallKind::Audio)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not connected"));
    // No media was touched.
    assert!(alice.devices.requests().is_empty());
}
