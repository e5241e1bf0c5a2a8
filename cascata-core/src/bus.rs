//! In-process publish/subscribe of context change events.
//!
//! Built on a broadcast ring: publishers never block, every subscriber owns
//! its own bounded cursor, and a subscriber that falls behind loses the
//! oldest pending events and observes an overflow marker. Overflowed
//! subscribers are expected to reconcile with a full listing.

use crate::context::ContextMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ContextEvent {
    Updated {
        context_id: String,
        metadata: ContextMetadata,
    },
    Deleted {
        context_id: String,
    },
}

impl ContextEvent {
    pub fn context_id(&self) -> &str {
        match self {
            ContextEvent::Updated { context_id, .. } => context_id,
            ContextEvent::Deleted { context_id } => context_id,
        }
    }
}

/// Message observed by a subscriber: either an event, or the marker that the
/// subscriber fell behind and lost `skipped` events.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(ContextEvent),
    Overflowed { skipped: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ContextEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Hand an event to every live subscriber. Fire-and-forget: a send with
    /// no subscribers is not an error, and no subscriber can block this call.
    pub fn publish(&self, event: ContextEvent) {
        let _ = self.tx.send(event);
        metrics::counter!("cascata_events_published_total").increment(1);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

pub struct EventSubscriber {
    rx: broadcast::Receiver<ContextEvent>,
}

impl EventSubscriber {
    /// Next message, in publication order. Returns `None` once the bus is
    /// gone and all pending events are drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.rx.recv().await {
            Ok(event) => Some(BusMessage::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(BusMessage::Overflowed { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Wire envelope for the event-stream endpoints, one JSON object per
/// `data: ...` chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub event: StreamEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContextMetadata>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Connected,
    Ping,
    Update,
    Delete,
    Resync,
}

impl StreamEnvelope {
    pub fn connected() -> Self {
        Self::control(StreamEventKind::Connected)
    }

    pub fn ping() -> Self {
        Self::control(StreamEventKind::Ping)
    }

    pub fn resync() -> Self {
        Self::control(StreamEventKind::Resync)
    }

    fn control(event: StreamEventKind) -> Self {
        Self {
            event,
            context_id: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_event(event: &ContextEvent) -> Self {
        match event {
            ContextEvent::Updated {
                context_id,
                metadata,
            } => Self {
                event: StreamEventKind::Update,
                context_id: Some(context_id.clone()),
                metadata: Some(metadata.clone()),
                timestamp: Utc::now(),
            },
            ContextEvent::Deleted { context_id } => Self {
                event: StreamEventKind::Delete,
                context_id: Some(context_id.clone()),
                metadata: None,
                timestamp: Utc::now(),
            },
        }
    }

    /// Encode as a single event-stream chunk.
    pub fn to_frame(&self) -> crate::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("data: {}\n\n", json))
    }

    /// Decode one line of an event-stream body. Lines that are not `data:`
    /// payloads (blank separators) yield `None`.
    pub fn parse_line(line: &str) -> crate::Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let payload = match trimmed.strip_prefix("data:") {
            Some(payload) => payload.trim_start(),
            None => return Ok(None),
        };

        let envelope = serde_json::from_str(payload)?;
        Ok(Some(envelope))
    }
}
