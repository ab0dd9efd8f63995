use crate::config::BusConfig;
use crate::stomp::error::StompError;
use crate::stomp::frame::{DecodeOutcome, StompCommand, StompFrame};
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);
/// Missed-heartbeat tolerance: the peer is declared dead after this many
/// negotiated receive intervals without traffic.
const HEARTBEAT_GRACE: u32 = 2;
/// Stand-in period for disabled heartbeat directions.
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Negotiated heartbeat cadence for one broker session.
#[derive(Debug, Clone, Copy)]
struct HeartbeatPlan {
    send_interval: Option<Duration>,
    recv_timeout: Option<Duration>,
}

impl HeartbeatPlan {
    /// Combines our CONNECT offer with the broker's CONNECTED reply
    /// (`sx,sy`: sx = what the broker sends, sy = what it wants to receive).
    fn negotiate(config: &BusConfig, server: (u64, u64)) -> Self {
        let (sx, sy) = server;
        let send_interval = if config.heartbeat_send_ms == 0 || sy == 0 {
            None
        } else {
            Some(Duration::from_millis(config.heartbeat_send_ms.max(sy)))
        };
        let recv_timeout = if config.heartbeat_recv_ms == 0 || sx == 0 {
            None
        } else {
            Some(Duration::from_millis(config.heartbeat_recv_ms.max(sx)))
        };
        Self {
            send_interval,
            recv_timeout,
        }
    }
}

/// How one broker session ended.
enum SessionEnd {
    /// Deliberate local disconnect; do not reconnect.
    Clean,
    /// Connection lost or protocol breakdown; eligible for reconnect.
    Dead,
}

/// STOMP 1.2 client over a WebSocket, implementing [`Transport`].
///
/// Reconnects on its own with a fixed delay and a bounded attempt budget,
/// replaying active subscriptions after each successful reconnect. The
/// layers above therefore never re-subscribe on connection loss.
pub struct StompClient {
    writer: Mutex<Option<WsSink>>,
    /// Active subscription ids mapped to their destinations, kept for
    /// replay after a reconnect.
    subscriptions: StdMutex<HashMap<String, String>>,
    next_subscription_id: AtomicU64,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_notifier: Notify,
    closed: AtomicBool,
    config: BusConfig,
    params: ConnectParams,
}

/// Factory connecting [`StompClient`] transports.
pub struct StompTransportFactory {
    config: BusConfig,
}

impl StompTransportFactory {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for StompTransportFactory {
    async fn create_transport(
        &self,
        params: &ConnectParams,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Bus/Stomp", "Dialing {}", params.endpoint);
        let (sink, stream, leftover, plan) = dial_and_handshake(&self.config, params).await?;
        info!(target: "Bus/Stomp", "Broker session established");

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(StompClient {
            writer: Mutex::new(Some(sink)),
            subscriptions: StdMutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
            event_tx: event_tx.clone(),
            shutdown_notifier: Notify::new(),
            closed: AtomicBool::new(false),
            config: self.config.clone(),
            params: params.clone(),
        });

        tokio::spawn(client.clone().supervise(stream, leftover, plan));
        let _ = event_tx.send(TransportEvent::Connected).await;
        Ok((client, event_rx))
    }
}

#[async_trait]
impl Transport for StompClient {
    async fn subscribe(&self, destination: &str) -> Result<String, anyhow::Error> {
        let id = format!(
            "sub-{}",
            self.next_subscription_id.fetch_add(1, Ordering::Relaxed)
        );
        self.subscriptions
            .lock()
            .expect("lock should not be poisoned")
            .insert(id.clone(), destination.to_string());

        let frame = StompFrame::new(StompCommand::Subscribe)
            .header("id", &id)
            .header("destination", destination)
            .header("ack", "auto");
        if let Err(e) = self.send_frame(frame).await {
            self.subscriptions
                .lock()
                .expect("lock should not be poisoned")
                .remove(&id);
            return Err(e.into());
        }
        debug!(target: "Bus/Stomp", "Subscribed {id} to {destination}");
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), anyhow::Error> {
        let known = self
            .subscriptions
            .lock()
            .expect("lock should not be poisoned")
            .remove(subscription_id)
            .is_some();
        if !known {
            debug!(target: "Bus/Stomp", "Ignoring unsubscribe for unknown id {subscription_id}");
            return Ok(());
        }
        let frame = StompFrame::new(StompCommand::Unsubscribe).header("id", subscription_id);
        self.send_frame(frame).await?;
        debug!(target: "Bus/Stomp", "Unsubscribed {subscription_id}");
        Ok(())
    }

    async fn send(&self, destination: &str, body: &[u8]) -> Result<(), anyhow::Error> {
        let frame = StompFrame::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(Bytes::copy_from_slice(body));
        self.send_frame(frame).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "Bus/Stomp", "Disconnecting transport intentionally");
        self.shutdown_notifier.notify_waiters();
    }
}

impl StompClient {
    async fn send_frame(&self, frame: StompFrame) -> Result<(), StompError> {
        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(StompError::SocketClosed)?;
        sink.send(to_ws_message(frame.encode())).await?;
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), StompError> {
        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(StompError::SocketClosed)?;
        sink.send(Message::text("\n".to_string())).await?;
        Ok(())
    }

    /// Best-effort DISCONNECT frame and socket close on deliberate shutdown.
    async fn send_goodbye(&self) {
        if let Err(e) = self.send_frame(StompFrame::new(StompCommand::Disconnect)).await {
            debug!(target: "Bus/Stomp", "DISCONNECT frame not sent: {e}");
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    async fn supervise(self: Arc<Self>, mut stream: WsStream, mut buf: BytesMut, mut plan: HeartbeatPlan) {
        loop {
            let end = self.run_session(&mut stream, &mut buf, plan).await;
            *self.writer.lock().await = None;

            if matches!(end, SessionEnd::Clean) || self.closed.load(Ordering::Acquire) {
                let _ = self.event_tx.send(TransportEvent::Closed).await;
                debug!(target: "Bus/Stomp", "Transport closed");
                return;
            }

            warn!(target: "Bus/Stomp", "Connection lost");
            let _ = self.event_tx.send(TransportEvent::Disconnected).await;

            match self.reconnect().await {
                Some((sink, new_stream, leftover, new_plan)) => {
                    *self.writer.lock().await = Some(sink);
                    stream = new_stream;
                    buf = leftover;
                    plan = new_plan;
                    if let Err(e) = self.replay_subscriptions().await {
                        // Socket died again mid-replay; the next session
                        // iteration will notice and retry.
                        warn!(target: "Bus/Stomp", "Subscription replay failed: {e}");
                    }
                    let _ = self.event_tx.send(TransportEvent::Connected).await;
                }
                None => {
                    info!(target: "Bus/Stomp", "Giving up on reconnection");
                    let _ = self.event_tx.send(TransportEvent::Closed).await;
                    return;
                }
            }
        }
    }

    /// Drives one broker session until it ends: reads frames, sends
    /// heartbeats, watches peer liveness.
    async fn run_session(
        &self,
        stream: &mut WsStream,
        buf: &mut BytesMut,
        plan: HeartbeatPlan,
    ) -> SessionEnd {
        // The handshake may have left complete frames behind.
        if matches!(self.drain_frames(buf).await, DrainEnd::Fatal) {
            return SessionEnd::Dead;
        }

        let send_period = plan.send_interval.unwrap_or(IDLE_PERIOD);
        let mut send_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + send_period, send_period);
        let check_period = plan.recv_timeout.unwrap_or(IDLE_PERIOD);
        let mut liveness_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + check_period, check_period);
        let mut last_activity = tokio::time::Instant::now();

        loop {
            // A disconnect may land between select polls; the notifier only
            // wakes registered waiters.
            if self.closed.load(Ordering::Acquire) {
                self.send_goodbye().await;
                return SessionEnd::Clean;
            }
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Bus/Stomp", "Shutdown signaled in session loop");
                    self.send_goodbye().await;
                    return SessionEnd::Clean;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            last_activity = tokio::time::Instant::now();
                            if !ingest(buf, msg) {
                                debug!(target: "Bus/Stomp", "Close frame received");
                                return SessionEnd::Dead;
                            }
                            if matches!(self.drain_frames(buf).await, DrainEnd::Fatal) {
                                return SessionEnd::Dead;
                            }
                        }
                        Some(Err(e)) => {
                            error!(target: "Bus/Stomp", "WebSocket read error: {e}");
                            return SessionEnd::Dead;
                        }
                        None => {
                            debug!(target: "Bus/Stomp", "WebSocket stream ended");
                            return SessionEnd::Dead;
                        }
                    }
                }
                _ = send_tick.tick(), if plan.send_interval.is_some() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(target: "Bus/Stomp", "Heartbeat send failed: {e}");
                        return SessionEnd::Dead;
                    }
                }
                _ = liveness_tick.tick(), if plan.recv_timeout.is_some() => {
                    if let Some(timeout) = plan.recv_timeout
                        && last_activity.elapsed() > timeout * HEARTBEAT_GRACE
                    {
                        warn!(
                            target: "Bus/Stomp",
                            "No traffic from broker for {:?}, declaring connection dead",
                            last_activity.elapsed()
                        );
                        return SessionEnd::Dead;
                    }
                }
            }
        }
    }

    async fn drain_frames(&self, buf: &mut BytesMut) -> DrainEnd {
        loop {
            match StompFrame::decode(buf) {
                Ok(DecodeOutcome::Incomplete) => return DrainEnd::Continue,
                Ok(DecodeOutcome::Heartbeat) => continue,
                Ok(DecodeOutcome::Frame(frame)) => self.handle_frame(frame).await,
                Err(e) => {
                    error!(target: "Bus/Stomp", "Protocol error, dropping connection: {e}");
                    return DrainEnd::Fatal;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: StompFrame) {
        match frame.command {
            StompCommand::Message => {
                let Some(destination) = frame.header_value("destination") else {
                    warn!(target: "Bus/Stomp", "MESSAGE frame without destination header");
                    return;
                };
                let _ = self
                    .event_tx
                    .send(TransportEvent::Message {
                        destination: destination.to_string(),
                        body: frame.body,
                    })
                    .await;
            }
            StompCommand::Error => {
                let text = error_text(&frame);
                warn!(target: "Bus/Stomp", "Broker reported error: {text}");
                let _ = self.event_tx.send(TransportEvent::Error(text)).await;
            }
            StompCommand::Receipt => {
                debug!(
                    target: "Bus/Stomp",
                    "Receipt {}",
                    frame.header_value("receipt-id").unwrap_or("<unset>")
                );
            }
            other => {
                debug!(target: "Bus/Stomp", "Ignoring unexpected {} frame", other.as_name());
            }
        }
    }

    /// Fixed-delay redial loop. Returns None once the attempt budget is
    /// spent or a deliberate disconnect arrives mid-wait.
    async fn reconnect(&self) -> Option<(WsSink, WsStream, BytesMut, HeartbeatPlan)> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let max = self.config.max_reconnect_attempts;
            if max != 0 && attempts > max {
                warn!(target: "Bus/Stomp", "Retry budget exhausted after {} attempts", attempts - 1);
                return None;
            }

            let delay = Duration::from_secs(self.config.reconnect_delay_secs);
            info!(target: "Bus/Stomp", "Reconnecting in {delay:?} (attempt {attempts})");
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => return None,
                _ = sleep(delay) => {}
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            match dial_and_handshake(&self.config, &self.params).await {
                Ok(parts) => {
                    info!(target: "Bus/Stomp", "Reconnected to {}", self.params.endpoint);
                    return Some(parts);
                }
                Err(e) => warn!(target: "Bus/Stomp", "Reconnect attempt failed: {e}"),
            }
        }
    }

    async fn replay_subscriptions(&self) -> Result<(), StompError> {
        let subs: Vec<(String, String)> = {
            let table = self
                .subscriptions
                .lock()
                .expect("lock should not be poisoned");
            table
                .iter()
                .map(|(id, dest)| (id.clone(), dest.clone()))
                .collect()
        };
        for (id, destination) in subs {
            debug!(target: "Bus/Stomp", "Replaying subscription {id} -> {destination}");
            let frame = StompFrame::new(StompCommand::Subscribe)
                .header("id", &id)
                .header("destination", &destination)
                .header("ack", "auto");
            self.send_frame(frame).await?;
        }
        Ok(())
    }
}

enum DrainEnd {
    Continue,
    Fatal,
}

/// Dials the WebSocket and performs the CONNECT/CONNECTED exchange.
/// Returns the split socket, any bytes read past CONNECTED, and the
/// negotiated heartbeat plan.
async fn dial_and_handshake(
    config: &BusConfig,
    params: &ConnectParams,
) -> Result<(WsSink, WsStream, BytesMut, HeartbeatPlan), StompError> {
    let (ws, _response) = connect_async(params.endpoint.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let connect = StompFrame::new(StompCommand::Connect)
        .header("accept-version", "1.2")
        .header("host", &config.host)
        .header("login", &params.login)
        .header("passcode", &params.passcode)
        .header(
            "heart-beat",
            &format!("{},{}", config.heartbeat_send_ms, config.heartbeat_recv_ms),
        );
    sink.send(to_ws_message(connect.encode())).await?;

    let mut buf = BytesMut::new();
    let deadline = sleep(HANDSHAKE_DEADLINE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(StompError::Handshake(
                    "timed out waiting for CONNECTED".to_string(),
                ));
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(StompError::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                };
                if !ingest(&mut buf, msg?) {
                    return Err(StompError::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                }
                loop {
                    match StompFrame::decode(&mut buf)? {
                        DecodeOutcome::Incomplete => break,
                        DecodeOutcome::Heartbeat => continue,
                        DecodeOutcome::Frame(frame) => match frame.command {
                            StompCommand::Connected => {
                                let server = parse_heart_beat(frame.header_value("heart-beat"));
                                let plan = HeartbeatPlan::negotiate(config, server);
                                debug!(target: "Bus/Stomp", "Negotiated heartbeats: {plan:?}");
                                return Ok((sink, stream, buf, plan));
                            }
                            StompCommand::Error => {
                                return Err(StompError::Broker(error_text(&frame)));
                            }
                            other => {
                                debug!(
                                    target: "Bus/Stomp",
                                    "Ignoring {} frame during handshake",
                                    other.as_name()
                                );
                            }
                        },
                    }
                }
            }
        }
    }
}

/// Appends a WebSocket message's payload to the STOMP receive buffer.
/// Returns false when the peer sent a close frame.
fn ingest(buf: &mut BytesMut, msg: Message) -> bool {
    match msg {
        Message::Text(text) => {
            buf.extend_from_slice(text.as_bytes());
            true
        }
        Message::Binary(data) => {
            buf.extend_from_slice(&data);
            true
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => true,
        Message::Close(_) => false,
    }
}

fn to_ws_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::text(text),
        Err(_) => Message::binary(payload),
    }
}

fn error_text(frame: &StompFrame) -> String {
    match frame.header_value("message") {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

/// Parses a `heart-beat` header value (`"sx,sy"`); absent or malformed
/// parts read as 0 (disabled).
fn parse_heart_beat(value: Option<&str>) -> (u64, u64) {
    let Some(value) = value else {
        return (0, 0);
    };
    let mut parts = value.splitn(2, ',');
    let sx = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    let sy = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    (sx, sy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(send_ms: u64, recv_ms: u64) -> BusConfig {
        BusConfig {
            heartbeat_send_ms: send_ms,
            heartbeat_recv_ms: recv_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_heartbeat_negotiation_takes_slower_side() {
        let plan = HeartbeatPlan::negotiate(&config(10_000, 10_000), (25_000, 5_000));
        assert_eq!(plan.send_interval, Some(Duration::from_millis(10_000)));
        assert_eq!(plan.recv_timeout, Some(Duration::from_millis(25_000)));
    }

    #[test]
    fn test_heartbeat_negotiation_zero_disables() {
        let plan = HeartbeatPlan::negotiate(&config(0, 10_000), (10_000, 10_000));
        assert!(plan.send_interval.is_none());
        assert_eq!(plan.recv_timeout, Some(Duration::from_millis(10_000)));

        let plan = HeartbeatPlan::negotiate(&config(10_000, 10_000), (0, 0));
        assert!(plan.send_interval.is_none());
        assert!(plan.recv_timeout.is_none());
    }

    #[test]
    fn test_parse_heart_beat_header() {
        assert_eq!(parse_heart_beat(Some("10000,20000")), (10_000, 20_000));
        assert_eq!(parse_heart_beat(Some("0,0")), (0, 0));
        assert_eq!(parse_heart_beat(Some("garbage")), (0, 0));
        assert_eq!(parse_heart_beat(None), (0, 0));
    }

    #[test]
    fn test_ingest_counts_text_and_binary() {
        let mut buf = BytesMut::new();
        assert!(ingest(&mut buf, Message::text("abc".to_string())));
        assert!(ingest(&mut buf, Message::binary(Bytes::from_static(b"def"))));
        assert_eq!(&buf[..], b"abcdef");
        assert!(!ingest(&mut buf, Message::Close(None)));
    }
}
