use crate::bus::channel::{ChannelKey, Identity};
use crate::bus::error::{BusError, Result};
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 100;

/// A channel message handler. Failures are logged per handler and never
/// stop delivery to the handlers registered after it.
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Connection lifecycle changes, re-surfaced from the transport.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Connected,
    /// The connection dropped. `terminal` is set once the transport has
    /// stopped retrying; otherwise it keeps redialing on its own.
    Disconnected { terminal: bool },
    /// A protocol-level error reported by the broker.
    Error(String),
}

/// Handle for removing one registered handler. Consumed on unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    key: ChannelKey,
    handler_id: u64,
}

struct ChannelEntry {
    destination: String,
    /// Set once the broker-side subscription is open. None while the
    /// first subscriber is still awaiting the transport call.
    transport_sub_id: Option<String>,
    /// Handlers in registration order.
    handlers: Vec<(u64, Handler)>,
}

/// Multiplexes logical channels over one broker connection.
///
/// Any number of handlers can share a channel; the broker sees at most one
/// subscription per destination, opened for the first handler and closed
/// after the last one leaves. Inbound payloads are parsed once and fanned
/// out in registration order.
pub struct Multiplexer {
    transport_factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    channels: StdMutex<HashMap<ChannelKey, ChannelEntry>>,
    identity: StdMutex<Option<Identity>>,
    connected: AtomicBool,
    connecting: AtomicBool,
    next_handler_id: AtomicU64,
    lifecycle_tx: broadcast::Sender<BusEvent>,
    shutdown_notifier: Notify,
}

impl Multiplexer {
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport_factory,
            transport: Mutex::new(None),
            channels: StdMutex::new(HashMap::new()),
            identity: StdMutex::new(None),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            next_handler_id: AtomicU64::new(0),
            lifecycle_tx,
            shutdown_notifier: Notify::new(),
        })
    }

    /// Lifecycle observer stream. Subscribe before `connect` to see the
    /// initial `Connected`.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<BusEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The identity the bus is connected as.
    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    /// Establishes the physical connection and stores the identity used
    /// for per-user destinations. A no-op when already connected or while
    /// another connect is in flight.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &str,
        identity: Identity,
        credential: &str,
    ) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = scopeguard::guard((), |_| {
            self.connecting.store(false, Ordering::Relaxed);
        });
        if self.is_connected() {
            return Ok(());
        }

        let params = ConnectParams {
            endpoint: endpoint.to_string(),
            login: identity.user_id.clone(),
            passcode: credential.to_string(),
        };
        let (transport, events) = self
            .transport_factory
            .create_transport(&params)
            .await
            .map_err(BusError::Transport)?;

        *self
            .identity
            .lock()
            .expect("lock should not be poisoned") = Some(identity);
        *self.transport.lock().await = Some(transport);
        self.connected.store(true, Ordering::Release);

        let mux = self.clone();
        tokio::spawn(mux.event_pump(events));
        info!(target: "Bus", "Connected to {endpoint}");
        Ok(())
    }

    /// Tears down every channel and deactivates the transport. Idempotent.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(target: "Bus", "Disconnecting from broker");
        self.shutdown_notifier.notify_waiters();

        let entries: Vec<(String, Option<String>)> = {
            let mut channels = self.channels.lock().expect("lock should not be poisoned");
            channels
                .drain()
                .map(|(_, e)| (e.destination, e.transport_sub_id))
                .collect()
        };
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            for (destination, sub_id) in entries {
                let Some(sub_id) = sub_id else { continue };
                if let Err(e) = transport.unsubscribe(&sub_id).await {
                    debug!(target: "Bus", "Unsubscribe of {destination} during disconnect failed: {e}");
                }
            }
            transport.disconnect().await;
        }
    }

    /// Serializes the payload and sends it to a destination. Fails with
    /// [`BusError::NotConnected`] while offline; nothing is queued or
    /// retried here.
    pub async fn publish<T: Serialize>(&self, destination: &str, payload: &T) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let body = serde_json::to_vec(payload)?;
        let transport = self.current_transport().await?;
        transport
            .send(destination, &body)
            .await
            .map_err(BusError::Transport)?;
        Ok(())
    }

    /// Registers a handler on a logical channel. The first handler for a
    /// key opens the broker-side subscription; later handlers share it.
    pub async fn subscribe(&self, key: ChannelKey, handler: Handler) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let user_id = self
            .identity()
            .map(|i| i.user_id)
            .ok_or(BusError::NotConnected)?;
        let destination = key.destination(&user_id);
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);

        // Membership and the first-in decision are made under the sync
        // lock; the transport call happens after release, and only the
        // caller that made the 0 -> 1 transition performs it.
        let is_first = {
            let mut channels = self.channels.lock().expect("lock should not be poisoned");
            let entry = channels.entry(key).or_insert_with(|| ChannelEntry {
                destination: destination.clone(),
                transport_sub_id: None,
                handlers: Vec::new(),
            });
            entry.handlers.push((handler_id, handler));
            entry.handlers.len() == 1
        };

        if is_first {
            let transport = self.current_transport().await?;
            match transport.subscribe(&destination).await {
                Ok(sub_id) => {
                    let orphaned = {
                        let mut channels =
                            self.channels.lock().expect("lock should not be poisoned");
                        match channels.get_mut(&key) {
                            Some(entry) => {
                                entry.transport_sub_id = Some(sub_id.clone());
                                false
                            }
                            // Everyone unsubscribed while the subscribe was
                            // in flight; nobody else will close it.
                            None => true,
                        }
                    };
                    if orphaned {
                        debug!(target: "Bus", "Closing orphaned subscription for {destination}");
                        let _ = transport.unsubscribe(&sub_id).await;
                    } else {
                        debug!(target: "Bus", "Opened channel {key:?} -> {destination}");
                    }
                }
                Err(e) => {
                    let dropped = {
                        let mut channels =
                            self.channels.lock().expect("lock should not be poisoned");
                        channels
                            .remove(&key)
                            .map(|entry| entry.handlers.len())
                            .unwrap_or(0)
                    };
                    if dropped > 1 {
                        warn!(
                            target: "Bus",
                            "Dropping {dropped} handlers on {key:?}: transport subscribe failed"
                        );
                    }
                    return Err(BusError::Transport(e));
                }
            }
        }
        Ok(Subscription { key, handler_id })
    }

    /// Removes one handler. The broker-side subscription is closed only
    /// when the handler set for the key becomes empty.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let teardown = {
            let mut channels = self.channels.lock().expect("lock should not be poisoned");
            let Some(entry) = channels.get_mut(&subscription.key) else {
                return;
            };
            let before = entry.handlers.len();
            entry
                .handlers
                .retain(|(id, _)| *id != subscription.handler_id);
            if entry.handlers.len() == before {
                return;
            }
            if entry.handlers.is_empty() {
                channels
                    .remove(&subscription.key)
                    .and_then(|e| e.transport_sub_id.map(|sid| (e.destination, sid)))
            } else {
                None
            }
        };

        if let Some((destination, sub_id)) = teardown {
            debug!(target: "Bus", "Closing channel {:?} ({destination})", subscription.key);
            let transport = self.transport.lock().await.clone();
            if let Some(transport) = transport
                && let Err(e) = transport.unsubscribe(&sub_id).await
            {
                warn!(target: "Bus", "Transport unsubscribe failed: {e}");
            }
        }
    }

    async fn current_transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(BusError::NotConnected)
    }

    async fn event_pump(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Bus", "Event pump stopped");
                    return;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!(target: "Bus", "Transport event channel closed");
                        return;
                    };
                    match event {
                        TransportEvent::Connected => {
                            self.connected.store(true, Ordering::Release);
                            let _ = self.lifecycle_tx.send(BusEvent::Connected);
                        }
                        TransportEvent::Message { destination, body } => {
                            self.dispatch(&destination, &body);
                        }
                        TransportEvent::Disconnected => {
                            self.connected.store(false, Ordering::Release);
                            let _ = self
                                .lifecycle_tx
                                .send(BusEvent::Disconnected { terminal: false });
                        }
                        TransportEvent::Closed => {
                            self.connected.store(false, Ordering::Release);
                            let _ = self
                                .lifecycle_tx
                                .send(BusEvent::Disconnected { terminal: true });
                            return;
                        }
                        TransportEvent::Error(text) => {
                            let _ = self.lifecycle_tx.send(BusEvent::Error(text));
                        }
                    }
                }
            }
        }
    }

    /// Parses the payload once and fans it out to every handler of the
    /// matching channel, in registration order. Handler failures are
    /// logged and do not stop the remaining handlers; malformed payloads
    /// are dropped before any handler runs.
    fn dispatch(&self, destination: &str, body: &[u8]) {
        let payload: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "Bus", "Dropping malformed payload on {destination}: {e}");
                return;
            }
        };

        let handlers: Vec<(u64, Handler)> = {
            let channels = self.channels.lock().expect("lock should not be poisoned");
            match channels.values().find(|e| e.destination == destination) {
                Some(entry) => entry.handlers.clone(),
                None => {
                    debug!(target: "Bus", "Message for {destination} with no listeners");
                    return;
                }
            }
        };

        for (id, handler) in handlers {
            if let Err(e) = handler(&payload) {
                error!(target: "Bus", "Handler {id} failed on {destination}: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransportFactory;

    fn identity() -> Identity {
        Identity {
            user_id: "u1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Rider".to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_already_connected() {
        let factory = Arc::new(MockTransportFactory::new());
        let mux = Multiplexer::new(factory.clone());

        mux.connect("wss://test", identity(), "token").await.unwrap();
        mux.connect("wss://test", identity(), "token").await.unwrap();
        mux.connect("wss://test", identity(), "token").await.unwrap();

        assert_eq!(factory.connect_count(), 1);
        assert!(mux.is_connected());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        let mux = Multiplexer::new(Arc::new(MockTransportFactory::new()));
        let err = mux
            .publish("/user/u2/queue/call", &serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_fails() {
        let mux = Multiplexer::new(Arc::new(MockTransportFactory::new()));
        let handler: Handler = Arc::new(|_| Ok(()));
        let err = mux
            .subscribe(ChannelKey::PrivateMessages, handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let factory = Arc::new(MockTransportFactory::new());
        let mux = Multiplexer::new(factory.clone());
        mux.connect("wss://test", identity(), "token").await.unwrap();

        mux.disconnect().await;
        mux.disconnect().await;

        assert!(!mux.is_connected());
        assert_eq!(factory.transport().disconnect_count(), 1);
    }
}
