//! Call coordinator: the phone-app layer above the engine.
//!
//! Tracks whether this side is idle, ringing or in a call, turns inbound
//! wire envelopes into engine operations, and answers them with the right
//! completion messages. One coordinator serves one bus identity.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};

use super::engine::{CallEngine, EngineEvent, OutboundSignal, SignalSender};
use super::error::CallError;
use super::signal::{CallKind, CallSignal, SignalKind};
use crate::bus::{BusError, ChannelKey, Handler, Multiplexer, Subscription};
use crate::platform::MediaStream;

const COORDINATOR_EVENT_CAPACITY: usize = 100;
const SIGNAL_QUEUE_CAPACITY: usize = 100;

/// An incoming ring awaiting accept or reject.
#[derive(Debug, Clone)]
pub struct RingingCall {
    pub call_id: String,
    pub caller_id: String,
    pub caller_first_name: Option<String>,
    pub caller_last_name: Option<String>,
    pub kind: CallKind,
}

/// A call this side placed or accepted.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub call_id: String,
    pub peer_id: String,
    pub kind: CallKind,
    /// True when this side placed the call.
    pub initiator: bool,
    /// False until the callee accepts; decides CANCELLED vs ENDED on
    /// hang-up.
    pub answered: bool,
}

/// Coordinator-level call state.
#[derive(Debug, Clone, Default)]
pub enum CallState {
    #[default]
    Idle,
    IncomingRinging(RingingCall),
    Active(ActiveCall),
}

/// Why a call left the active or ringing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// This side hung up an answered call.
    HungUp,
    /// The peer ended the call.
    RemoteEnded,
    /// The callee rejected our outgoing call.
    Rejected,
    /// The ring was withdrawn before anyone answered.
    Cancelled,
    /// This side declined an incoming ring.
    Declined,
    /// The call died on a local or connection failure.
    Failed,
}

/// Events the coordinator broadcasts to the UI layer.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    IncomingCall {
        call_id: String,
        caller_id: String,
        caller_first_name: Option<String>,
        caller_last_name: Option<String>,
        kind: CallKind,
    },
    OutgoingCall {
        call_id: String,
        recipient_id: String,
        kind: CallKind,
    },
    /// The local accept completed and the session is live.
    CallAnswered { call_id: String },
    CallConnected { call_id: String },
    LocalStream {
        call_id: String,
        stream: Arc<MediaStream>,
    },
    RemoteStream {
        call_id: String,
        stream: Arc<MediaStream>,
    },
    CallEnded { call_id: String, reason: EndReason },
    Error {
        call_id: Option<String>,
        message: String,
    },
}

/// Publishes engine-generated signaling on the bus as wire envelopes.
pub struct BusSignalSender {
    mux: Arc<Multiplexer>,
}

impl BusSignalSender {
    pub fn new(mux: Arc<Multiplexer>) -> Arc<Self> {
        Arc::new(Self { mux })
    }
}

#[async_trait]
impl SignalSender for BusSignalSender {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), anyhow::Error> {
        let me = self
            .mux
            .identity()
            .map(|i| i.user_id)
            .ok_or_else(|| anyhow::anyhow!("bus identity not available"))?;
        let envelope = match signal {
            OutboundSignal::Offer {
                call_id,
                to,
                kind,
                description,
            } => CallSignal::offer(&me, &to, kind, &call_id, description),
            OutboundSignal::Answer {
                call_id,
                to,
                kind,
                description,
            } => CallSignal::answer(&me, &to, kind, &call_id, description),
            OutboundSignal::IceCandidate {
                call_id,
                to,
                kind,
                candidate,
            } => CallSignal::ice_candidate(&me, &to, kind, &call_id, candidate),
        };
        let destination = ChannelKey::CallSignals.destination(&envelope.recipient_id);
        self.mux.publish(&destination, &envelope).await?;
        Ok(())
    }
}

/// Orchestrates one call at a time between the bus and the engine.
pub struct CallCoordinator {
    mux: Arc<Multiplexer>,
    engine: Arc<CallEngine>,
    state: Mutex<CallState>,
    signal_tx: mpsc::Sender<CallSignal>,
    signal_rx: StdMutex<Option<mpsc::Receiver<CallSignal>>>,
    subscription: StdMutex<Option<Subscription>>,
    started: AtomicBool,
    shutdown_notifier: Notify,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl CallCoordinator {
    pub fn new(mux: Arc<Multiplexer>, engine: Arc<CallEngine>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(COORDINATOR_EVENT_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        Arc::new(Self {
            mux,
            engine,
            state: Mutex::new(CallState::Idle),
            signal_tx,
            signal_rx: StdMutex::new(Some(signal_rx)),
            subscription: StdMutex::new(None),
            started: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
            event_tx,
        })
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the coordinator state.
    pub async fn current_state(&self) -> CallState {
        self.state.lock().await.clone()
    }

    /// Attaches to the bus call channel and starts the signal loop. Call
    /// once the bus is connected; a second start is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tx = self.signal_tx.clone();
        let handler: Handler = Arc::new(move |value: &Value| {
            let signal: CallSignal = serde_json::from_value(value.clone())?;
            tx.try_send(signal)
                .map_err(|e| anyhow::anyhow!("signal queue full: {e}"))?;
            Ok(())
        });
        let subscription = match self.mux.subscribe(ChannelKey::CallSignals, handler).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *self
            .subscription
            .lock()
            .expect("lock should not be poisoned") = Some(subscription);

        let signal_rx = self
            .signal_rx
            .lock()
            .expect("lock should not be poisoned")
            .take();
        match signal_rx {
            Some(rx) => {
                let coordinator = self.clone();
                let engine_events = self.engine.events();
                tokio::spawn(coordinator.run_signal_loop(rx, engine_events));
            }
            // The loop cannot be revived once shut down.
            None => warn!(target: "Calls/Coordinator", "Restart after shutdown is not supported"),
        }
        info!(target: "Calls/Coordinator", "Attached to call channel");
        Ok(())
    }

    /// Detaches from the bus and stops the signal loop. Terminal.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let subscription = self
            .subscription
            .lock()
            .expect("lock should not be poisoned")
            .take();
        if let Some(subscription) = subscription {
            self.mux.unsubscribe(subscription).await;
        }
        self.shutdown_notifier.notify_waiters();
    }

    /// Rings a recipient. Returns the generated call id once the request
    /// is on the wire; the caller side has no ringing state and goes
    /// straight to active.
    pub async fn place_call(&self, recipient_id: &str, kind: CallKind) -> Result<String, CallError> {
        if !self.mux.is_connected() {
            return Err(CallError::Bus(BusError::NotConnected));
        }
        let mut state = self.state.lock().await;
        if !matches!(*state, CallState::Idle) {
            return Err(CallError::Busy);
        }
        let identity = self
            .mux
            .identity()
            .ok_or(CallError::Bus(BusError::NotConnected))?;

        let call_id = generate_call_id();
        self.engine.start_call(recipient_id, kind, &call_id).await?;

        let request = CallSignal::request(&identity, recipient_id, kind, &call_id);
        if let Err(e) = self.publish_signal(&request).await {
            warn!(target: "Calls/Coordinator", "Could not ring {recipient_id}: {e}");
            let _ = self.engine.end_call().await;
            return Err(e);
        }

        *state = CallState::Active(ActiveCall {
            call_id: call_id.clone(),
            peer_id: recipient_id.to_string(),
            kind,
            initiator: true,
            answered: false,
        });
        drop(state);

        info!(target: "Calls/Coordinator", "Placed {kind:?} call {call_id} to {recipient_id}");
        self.emit(CoordinatorEvent::OutgoingCall {
            call_id: call_id.clone(),
            recipient_id: recipient_id.to_string(),
            kind,
        });
        Ok(call_id)
    }

    /// Accepts the ringing incoming call: media up first, then the accept
    /// on the wire. Media denial rejects the call instead.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        let CallState::IncomingRinging(ringing) = (*state).clone() else {
            return Err(CallError::NoIncomingCall);
        };

        if let Err(e) = self
            .engine
            .answer_call(&ringing.caller_id, ringing.kind, &ringing.call_id)
            .await
        {
            warn!(
                target: "Calls/Coordinator",
                "Accept failed for {}: {e}", ringing.call_id
            );
            *state = CallState::Idle;
            drop(state);
            self.send_reject(&ringing).await;
            self.emit(CoordinatorEvent::CallEnded {
                call_id: ringing.call_id.clone(),
                reason: EndReason::Failed,
            });
            return Err(e);
        }

        let Some(me) = self.our_id() else {
            *state = CallState::Idle;
            drop(state);
            let _ = self.engine.end_call().await;
            return Err(CallError::Bus(BusError::NotConnected));
        };
        let accepted = CallSignal::accepted(&me, &ringing.caller_id, ringing.kind, &ringing.call_id);
        if let Err(e) = self.publish_signal(&accepted).await {
            *state = CallState::Idle;
            drop(state);
            let _ = self.engine.end_call().await;
            return Err(e);
        }

        *state = CallState::Active(ActiveCall {
            call_id: ringing.call_id.clone(),
            peer_id: ringing.caller_id.clone(),
            kind: ringing.kind,
            initiator: false,
            answered: true,
        });
        drop(state);

        info!(target: "Calls/Coordinator", "Accepted call {}", ringing.call_id);
        self.emit(CoordinatorEvent::CallAnswered {
            call_id: ringing.call_id,
        });
        Ok(())
    }

    /// Declines the ringing incoming call. Without one this is a no-op.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let ringing = {
            let mut state = self.state.lock().await;
            match &*state {
                CallState::IncomingRinging(ringing) => {
                    let snapshot = ringing.clone();
                    *state = CallState::Idle;
                    Some(snapshot)
                }
                _ => None,
            }
        };
        let Some(ringing) = ringing else {
            debug!(target: "Calls/Coordinator", "No ring to reject");
            return Ok(());
        };

        info!(target: "Calls/Coordinator", "Rejecting call {}", ringing.call_id);
        self.send_reject(&ringing).await;
        self.emit(CoordinatorEvent::CallEnded {
            call_id: ringing.call_id,
            reason: EndReason::Declined,
        });
        Ok(())
    }

    /// Ends or cancels the current call. While an outgoing call is still
    /// unanswered the peer receives CALL_CANCELLED so its ring stops;
    /// otherwise CALL_ENDED.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        {
            let state = self.state.lock().await;
            if matches!(*state, CallState::IncomingRinging(_)) {
                drop(state);
                return self.reject_call().await;
            }
        }

        let active = {
            let mut state = self.state.lock().await;
            match &*state {
                CallState::Active(active) => {
                    let snapshot = active.clone();
                    *state = CallState::Idle;
                    Some(snapshot)
                }
                _ => None,
            }
        };
        let Some(active) = active else {
            debug!(target: "Calls/Coordinator", "Nothing to hang up");
            return Ok(());
        };

        let cancelled = active.initiator && !active.answered;
        if let Some(me) = self.our_id() {
            let signal = if cancelled {
                CallSignal::cancelled(&me, &active.peer_id, active.kind, &active.call_id)
            } else {
                CallSignal::ended(&me, &active.peer_id, active.kind, &active.call_id)
            };
            if let Err(e) = self.publish_signal(&signal).await {
                debug!(target: "Calls/Coordinator", "Peer hang-up notification failed: {e}");
            }
        }
        let _ = self.engine.end_call_for(&active.call_id).await;

        info!(
            target: "Calls/Coordinator",
            "Hung up {} ({})", active.call_id, if cancelled { "cancelled" } else { "ended" }
        );
        self.emit(CoordinatorEvent::CallEnded {
            call_id: active.call_id.clone(),
            reason: if cancelled {
                EndReason::Cancelled
            } else {
                EndReason::HungUp
            },
        });
        Ok(())
    }

    /// Feeds one inbound envelope through the state machine. Normally
    /// driven by the bus subscription.
    pub async fn handle_signal(&self, signal: CallSignal) {
        debug!(
            target: "Calls/Coordinator",
            "Inbound {:?} from {}", signal.kind, signal.caller_id
        );
        match signal.kind {
            SignalKind::CallRequest => self.on_call_request(signal).await,
            SignalKind::CallAccepted => self.on_call_accepted(signal).await,
            SignalKind::CallRejected => self.on_call_rejected(signal).await,
            SignalKind::CallCancelled => {
                self.on_call_withdrawn(signal, EndReason::Cancelled).await
            }
            SignalKind::CallEnded => {
                self.on_call_withdrawn(signal, EndReason::RemoteEnded).await
            }
            SignalKind::Offer => self.on_offer(signal).await,
            SignalKind::Answer => self.on_answer(signal).await,
            SignalKind::IceCandidate => self.on_ice_candidate(signal).await,
        }
    }

    async fn on_call_request(&self, signal: CallSignal) {
        let Some(call_id) = signal.call_id else {
            warn!(target: "Calls/Coordinator", "Call request without call id, ignoring");
            return;
        };
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, CallState::Idle) {
                debug!(target: "Calls/Coordinator", "Busy, ignoring call request {call_id}");
                return;
            }
            *state = CallState::IncomingRinging(RingingCall {
                call_id: call_id.clone(),
                caller_id: signal.caller_id.clone(),
                caller_first_name: signal.caller_first_name.clone(),
                caller_last_name: signal.caller_last_name.clone(),
                kind: signal.call_type,
            });
        }
        info!(
            target: "Calls/Coordinator",
            "Incoming {:?} call {call_id} from {}", signal.call_type, signal.caller_id
        );
        self.emit(CoordinatorEvent::IncomingCall {
            call_id,
            caller_id: signal.caller_id,
            caller_first_name: signal.caller_first_name,
            caller_last_name: signal.caller_last_name,
            kind: signal.call_type,
        });
    }

    async fn on_call_accepted(&self, signal: CallSignal) {
        let call_id = {
            let mut state = self.state.lock().await;
            match &mut *state {
                CallState::Active(active)
                    if active.initiator && signal.matches_call(&active.call_id) =>
                {
                    active.answered = true;
                    Some(active.call_id.clone())
                }
                _ => None,
            }
        };
        let Some(call_id) = call_id else {
            debug!(target: "Calls/Coordinator", "Stale CALL_ACCEPTED, ignoring");
            return;
        };

        info!(target: "Calls/Coordinator", "Call {call_id} accepted, sending offer");
        if let Err(e) = self.engine.create_and_send_offer().await {
            warn!(target: "Calls/Coordinator", "Offer failed for {call_id}: {e}");
            self.wind_down_active(&call_id, EndReason::Failed, true).await;
        }
    }

    async fn on_call_rejected(&self, signal: CallSignal) {
        let Some(call_id) = signal.call_id.as_deref() else {
            return;
        };
        self.wind_down_active(call_id, EndReason::Rejected, false).await;
    }

    /// CALL_CANCELLED and CALL_ENDED share a shape: clear a matching ring,
    /// or wind down a matching active call.
    async fn on_call_withdrawn(&self, signal: CallSignal, reason: EndReason) {
        let Some(call_id) = signal.call_id.as_deref() else {
            return;
        };

        enum Outcome {
            ClearedRing,
            OtherRing,
            NotRinging,
        }
        let outcome = {
            let mut state = self.state.lock().await;
            match &*state {
                CallState::IncomingRinging(ringing) if ringing.call_id == call_id => {
                    *state = CallState::Idle;
                    Outcome::ClearedRing
                }
                CallState::IncomingRinging(_) => Outcome::OtherRing,
                _ => Outcome::NotRinging,
            }
        };
        match outcome {
            Outcome::ClearedRing => {
                info!(target: "Calls/Coordinator", "Ring {call_id} withdrawn");
                let _ = self.engine.end_call_for(call_id).await;
                self.emit(CoordinatorEvent::CallEnded {
                    call_id: call_id.to_string(),
                    reason,
                });
            }
            Outcome::OtherRing => {
                debug!(
                    target: "Calls/Coordinator",
                    "{:?} for another call, ignoring", signal.kind
                );
            }
            Outcome::NotRinging => self.wind_down_active(call_id, reason, false).await,
        }
    }

    async fn on_offer(&self, signal: CallSignal) {
        let (Some(call_id), Some(description)) = (signal.call_id, signal.offer) else {
            warn!(target: "Calls/Coordinator", "Malformed OFFER, ignoring");
            return;
        };
        if !self.is_active_call(&call_id).await {
            debug!(target: "Calls/Coordinator", "OFFER for inactive call {call_id}, discarding");
            return;
        }
        if let Err(e) = self.engine.handle_offer(&call_id, description).await {
            warn!(target: "Calls/Coordinator", "Offer handling failed: {e}");
        }
    }

    async fn on_answer(&self, signal: CallSignal) {
        let (Some(call_id), Some(description)) = (signal.call_id, signal.answer) else {
            warn!(target: "Calls/Coordinator", "Malformed ANSWER, ignoring");
            return;
        };
        if !self.is_active_call(&call_id).await {
            debug!(target: "Calls/Coordinator", "ANSWER for inactive call {call_id}, discarding");
            return;
        }
        if let Err(e) = self.engine.handle_answer(&call_id, description).await {
            warn!(target: "Calls/Coordinator", "Answer handling failed: {e}");
        }
    }

    async fn on_ice_candidate(&self, signal: CallSignal) {
        let (Some(call_id), Some(candidate)) = (signal.call_id, signal.candidate) else {
            warn!(target: "Calls/Coordinator", "Malformed ICE_CANDIDATE, ignoring");
            return;
        };
        if !self.is_active_call(&call_id).await {
            debug!(
                target: "Calls/Coordinator",
                "Candidate for inactive call {call_id}, discarding"
            );
            return;
        }
        if let Err(e) = self.engine.handle_ice_candidate(&call_id, candidate).await {
            warn!(target: "Calls/Coordinator", "Candidate handling failed: {e}");
        }
    }

    async fn run_signal_loop(
        self: Arc<Self>,
        mut signal_rx: mpsc::Receiver<CallSignal>,
        mut engine_events: broadcast::Receiver<EngineEvent>,
    ) {
        debug!(target: "Calls/Coordinator", "Signal loop running");
        loop {
            // Shutdown may land while an event is being handled; the
            // notifier only wakes registered waiters.
            if !self.started.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => break,
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(signal).await,
                        None => break,
                    }
                }
                event = engine_events.recv() => {
                    match event {
                        Ok(event) => self.handle_engine_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                target: "Calls/Coordinator",
                                "Engine event stream lagged by {missed}"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!(target: "Calls/Coordinator", "Signal loop stopped");
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::LocalStream { call_id, stream } => {
                self.emit(CoordinatorEvent::LocalStream { call_id, stream });
            }
            EngineEvent::RemoteStream { call_id, stream } => {
                self.emit(CoordinatorEvent::RemoteStream { call_id, stream });
            }
            EngineEvent::Connected { call_id } => {
                self.emit(CoordinatorEvent::CallConnected { call_id });
            }
            EngineEvent::Error { call_id, message } => {
                self.emit(CoordinatorEvent::Error { call_id, message });
            }
            EngineEvent::CallEnded { call_id } => {
                // Engine-initiated teardown, e.g. a connection failure. A
                // locally driven end clears the state before this event
                // arrives and makes this a no-op.
                self.wind_down_active(&call_id, EndReason::Failed, true).await;
            }
        }
    }

    /// Clears the active call if it matches: optionally tells the peer,
    /// makes sure the engine session is gone, and reports the end reason.
    async fn wind_down_active(&self, call_id: &str, reason: EndReason, notify_peer: bool) {
        let cleared = {
            let mut state = self.state.lock().await;
            match &*state {
                CallState::Active(active) if active.call_id == call_id => {
                    let snapshot = active.clone();
                    *state = CallState::Idle;
                    Some(snapshot)
                }
                _ => None,
            }
        };
        let Some(active) = cleared else {
            return;
        };

        if notify_peer {
            if let Some(me) = self.our_id() {
                let signal = CallSignal::ended(&me, &active.peer_id, active.kind, call_id);
                if let Err(e) = self.publish_signal(&signal).await {
                    debug!(target: "Calls/Coordinator", "Peer end notification failed: {e}");
                }
            }
        }
        let _ = self.engine.end_call_for(call_id).await;

        info!(target: "Calls/Coordinator", "Call {call_id} wound down: {reason:?}");
        self.emit(CoordinatorEvent::CallEnded {
            call_id: call_id.to_string(),
            reason,
        });
    }

    async fn is_active_call(&self, call_id: &str) -> bool {
        matches!(
            &*self.state.lock().await,
            CallState::Active(active) if active.call_id == call_id
        )
    }

    async fn send_reject(&self, ringing: &RingingCall) {
        if let Some(me) = self.our_id() {
            let signal =
                CallSignal::rejected(&me, &ringing.caller_id, ringing.kind, &ringing.call_id);
            if let Err(e) = self.publish_signal(&signal).await {
                debug!(target: "Calls/Coordinator", "Reject notification failed: {e}");
            }
        }
        // No session should exist for an unanswered ring; clear any
        // leftover one.
        let _ = self.engine.end_call_for(&ringing.call_id).await;
    }

    async fn publish_signal(&self, signal: &CallSignal) -> Result<(), CallError> {
        let destination = ChannelKey::CallSignals.destination(&signal.recipient_id);
        self.mux.publish(&destination, signal).await?;
        Ok(())
    }

    fn our_id(&self) -> Option<String> {
        self.mux.identity().map(|i| i.user_id)
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Time-prefixed so ids sort chronologically in logs; the random suffix
/// keeps two parties dialing in the same millisecond apart.
fn generate_call_id() -> String {
    format!("{}-{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_shape() {
        let id = generate_call_id();
        let (prefix, suffix) = id.split_once('-').unwrap();
        assert!(prefix.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 8);
        assert!(u32::from_str_radix(suffix, 16).is_ok());
    }

    #[test]
    fn test_call_ids_differ() {
        assert_ne!(generate_call_id(), generate_call_id());
    }
}
