//! # event-bus
//!
//! Fan-out of small JSON-serializable activity events to an unbounded set of
//! subscribers (the SSE stream and anything else that cares).
//!
//! Backpressure is explicit: the global publish channel is bounded (100) and
//! publishing never blocks; a subscriber whose own bounded channel (10) is
//! full has events dropped for it alone, never for the others.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PUBLISH_DEPTH: usize = 100;
const SUBSCRIBER_DEPTH: usize = 10;

/// Kinds of activity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DhcpDiscover,
    DhcpOffer,
    DhcpRequest,
    DhcpAck,
    DhcpNak,
    DhcpRelease,
    DhcpDecline,
    LeaseExpired,
    GitSync,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DhcpDiscover => "dhcp_discover",
            EventType::DhcpOffer => "dhcp_offer",
            EventType::DhcpRequest => "dhcp_request",
            EventType::DhcpAck => "dhcp_ack",
            EventType::DhcpNak => "dhcp_nak",
            EventType::DhcpRelease => "dhcp_release",
            EventType::DhcpDecline => "dhcp_decline",
            EventType::LeaseExpired => "lease_expired",
            EventType::GitSync => "git_sync",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity event; `id` is monotone per process.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub id: u64,
    #[serde(serialize_with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

fn rfc3339<S: serde::Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

struct Inner {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<ActivityEvent>>>,
    publish_tx: mpsc::Sender<ActivityEvent>,
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
}

/// Clonable publishing/subscribing handle.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster").finish()
    }
}

/// A registered subscriber; dropping it unregisters.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<ActivityEvent>,
    inner: Weak<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.write().unwrap().remove(&self.id);
        }
    }
}

impl Broadcaster {
    /// Create the bus and spawn its fan-out task; the task exits when the
    /// token is cancelled.
    pub fn start(token: CancellationToken) -> Self {
        let (publish_tx, mut publish_rx) = mpsc::channel(PUBLISH_DEPTH);
        let inner = Arc::new(Inner {
            subscribers: RwLock::new(HashMap::new()),
            publish_tx,
            next_event_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
        });

        let fanout = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("event bus stopping");
                        return;
                    }
                    event = publish_rx.recv() => {
                        let Some(event) = event else { return };
                        let subscribers = fanout.subscribers.read().unwrap();
                        for (id, tx) in subscribers.iter() {
                            if tx.try_send(event.clone()).is_err() {
                                // this subscriber is full or gone; the event
                                // still reaches everyone else
                                warn!(subscriber = *id, "subscriber channel full, dropping event");
                            }
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.inner.subscribers.write().unwrap().insert(id, tx);
        Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }

    fn publish(&self, kind: EventType, message: String, details: serde_json::Map<String, serde_json::Value>) {
        let event = ActivityEvent {
            id: self.inner.next_event_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
            message,
            details,
        };
        if self.inner.publish_tx.try_send(event).is_err() {
            warn!("publish channel full, dropping event");
        }
    }

    /// Publish a DHCP lifecycle event.
    pub fn dhcp_event(
        &self,
        kind: EventType,
        ip: Ipv4Addr,
        mac: impl std::fmt::Display,
        hostname: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) {
        let mac = mac.to_string();
        let message = if hostname.is_empty() {
            format!("{kind}: {ip} ({mac})")
        } else {
            format!("{kind}: {ip} ({mac}) - {hostname}")
        };
        let mut details = extra;
        details.insert("ip".into(), ip.to_string().into());
        details.insert("mac".into(), mac.into());
        details.insert("hostname".into(), hostname.into());
        self.publish(kind, message, details);
    }

    /// Publish a lease-expiry sweep result.
    pub fn lease_expired(&self, count: u64) {
        let mut details = serde_json::Map::new();
        details.insert("count".into(), count.into());
        self.publish(
            EventType::LeaseExpired,
            format!("{count} lease(s) expired"),
            details,
        );
    }

    /// Publish a git sync outcome.
    pub fn git_sync(
        &self,
        success: bool,
        commit_hash: &str,
        commit_message: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut message = if success {
            "Git sync completed".to_string()
        } else {
            "Git sync failed".to_string()
        };
        if !commit_message.is_empty() {
            message = format!("{message}: {}", commit_message.trim_end());
        }
        let mut details = extra;
        details.insert("success".into(), success.into());
        details.insert("commit_hash".into(), commit_hash.into());
        details.insert("commit_message".into(), commit_message.into());
        self.publish(EventType::GitSync, message, details);
    }
}
