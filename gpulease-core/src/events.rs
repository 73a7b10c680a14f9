//! Publish-only fan-out of lease, handoff and HA transitions.
//!
//! Backed by a `tokio::sync::broadcast` channel: every subscriber gets its own
//! bounded view of the ring buffer, a slow subscriber loses the oldest events,
//! and publishing never waits on anyone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::{now_ms, Timestamp};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    LeaseChanged,
    HandoffPhase,
    HaStateChanged,
    FallbackNotice,
}

impl EventKind {
    /// Wire name, same as the serde form
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::LeaseChanged => "LEASE_CHANGED",
            EventKind::HandoffPhase => "HANDOFF_PHASE",
            EventKind::HaStateChanged => "HA_STATE_CHANGED",
            EventKind::FallbackNotice => "FALLBACK_NOTICE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, kind: EventKind, payload: Value) {
        let event = Event {
            kind,
            payload,
            timestamp: now_ms(),
        };
        // Err only means nobody is listening right now
        if self.tx.send(event).is_err() {
            tracing::trace!(?kind, "event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Raw receiver, for adapters that want a `Stream` (e.g. SSE).
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// One subscriber connection. Dropping it disconnects; nothing is replayed on
/// reconnect.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, skipping over anything lost to lag. `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagging, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagging, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
