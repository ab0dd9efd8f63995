use crate::bus::multiplexer::Handler;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Delivery state reported by the server for one sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Delivered,
    Failed,
}

/// Server acknowledgment for an optimistically sent message, matched back
/// to the send strictly by its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub correlation_id: String,
    /// Server-assigned id of the stored message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Conversation the message landed in. The server fills this in for
    /// sends that started a brand-new conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingAck {
    sender: oneshot::Sender<Acknowledgment>,
    created_at: DateTime<Utc>,
}

/// Tracks in-flight sends awaiting a server acknowledgment.
///
/// Generates correlation ids unique for this instance's lifetime and
/// routes each acknowledgment to the registered waiter for exactly that
/// id. Message content is never stored or inspected here; reconciliation
/// is by id alone.
pub struct Outbox {
    unique_id: String,
    id_counter: AtomicU64,
    waiters: DashMap<String, PendingAck>,
}

impl Outbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            unique_id: format!("{:x}", rand::random::<u32>()),
            id_counter: AtomicU64::new(0),
            waiters: DashMap::new(),
        })
    }

    /// Generates a new unique correlation id.
    pub fn next_correlation_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Registers a waiter for a correlation id. The receiver resolves when
    /// the matching acknowledgment arrives. Registering the same id twice
    /// replaces the earlier waiter.
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<Acknowledgment> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingAck {
            sender: tx,
            created_at: Utc::now(),
        };
        if self
            .waiters
            .insert(correlation_id.to_string(), pending)
            .is_some()
        {
            warn!(target: "Bus/Outbox", "Replaced existing waiter for correlation id {correlation_id}");
        }
        rx
    }

    /// Routes an acknowledgment to its waiter. Returns false when no
    /// waiter is registered for the id (duplicate or stale ack).
    pub fn resolve(&self, ack: Acknowledgment) -> bool {
        match self.waiters.remove(&ack.correlation_id) {
            Some((id, pending)) => {
                debug!(
                    target: "Bus/Outbox",
                    "Ack for {id} after {}ms",
                    (Utc::now() - pending.created_at).num_milliseconds()
                );
                if pending.sender.send(ack).is_err() {
                    debug!(target: "Bus/Outbox", "Waiter for {id} no longer listening");
                }
                true
            }
            None => {
                debug!(
                    target: "Bus/Outbox",
                    "Ignoring ack for unknown correlation id {}",
                    ack.correlation_id
                );
                false
            }
        }
    }

    /// Consumer-driven cleanup of one pending entry.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Drops waiters older than `max_age`; their receivers resolve with an
    /// error. Returns how many were dropped.
    pub fn expire_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.waiters.len();
        self.waiters.retain(|_, pending| pending.created_at > cutoff);
        before - self.waiters.len()
    }

    /// Drops every pending waiter, e.g. after a disconnect.
    pub fn clear(&self) -> usize {
        let dropped = self.waiters.len();
        self.waiters.clear();
        dropped
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    /// Builds the handler to register on the acknowledgment channel:
    /// parses the payload and routes it by correlation id.
    pub fn handler(self: &Arc<Self>) -> Handler {
        let outbox = self.clone();
        Arc::new(move |payload: &Value| {
            let ack: Acknowledgment = serde_json::from_value(payload.clone())
                .map_err(|e| anyhow::anyhow!("malformed acknowledgment: {e}"))?;
            outbox.resolve(ack);
            Ok(())
        })
    }
}
