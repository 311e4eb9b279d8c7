//! Event envelope - the common wrapper for published events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClusterEvent, EventError};

/// The event envelope - common metadata for all published events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned by the publisher.
    pub event_id: u64,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g., "circuit.state_changed").
    pub event_type: String,

    /// Event-specific payload.
    pub event: ClusterEvent,
}

impl EventEnvelope {
    /// Wrap an event, stamping it with the current time.
    pub fn new(event_id: u64, event: ClusterEvent) -> Self {
        Self::at(event_id, Utc::now(), event)
    }

    /// Wrap an event with an explicit occurrence time.
    pub fn at(event_id: u64, occurred_at: DateTime<Utc>, event: ClusterEvent) -> Self {
        Self {
            event_id,
            occurred_at,
            event_type: event.event_type().to_string(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope, checking that `event_type` agrees with the payload.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let envelope: EventEnvelope = serde_json::from_str(json)?;
        if envelope.event_type != envelope.event.event_type() {
            return Err(EventError::InvalidPayload(format!(
                "event_type {} does not match payload {}",
                envelope.event_type,
                envelope.event.event_type()
            )));
        }
        Ok(envelope)
    }
}
