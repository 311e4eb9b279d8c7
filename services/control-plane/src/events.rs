//! In-process event bus.
//!
//! Components publish typed [`ClusterEvent`]s; observers subscribe and
//! receive [`EventEnvelope`]s stamped with a monotonic id. Publishing never
//! blocks: slow subscribers lag and miss events rather than stalling the
//! publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_events::{ClusterEvent, EventEnvelope};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cloneable handle to the shared event channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    tx: broadcast::Sender<EventEnvelope>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event, returning its id.
    pub fn publish(&self, event: ClusterEvent) -> u64 {
        let event_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope::new(event_id, event);
        debug!(event_id, event_type = %envelope.event_type, "Publishing event");

        // No subscribers is not an error.
        let _ = self.inner.tx.send(envelope);
        event_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<ClusterEvent> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope.event);
    }
    out
}
