use fleet_events::{ClusterEvent, EventEnvelope};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::events::EventBus;

/// Logs cluster events. Scaling decisions are the hand-off to the external
/// node-lifecycle actuator and are logged at info.
pub struct EventLogger {
    rx: broadcast::Receiver<EventEnvelope>,
}

impl EventLogger {
    pub fn new(events: &EventBus) -> Self {
        Self {
            rx: events.subscribe(),
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting event logger");

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok(envelope) => log_event(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event logger shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn log_event(envelope: &EventEnvelope) {
    match &envelope.event {
        ClusterEvent::ScalingDecided(decision) => info!(
            event_id = envelope.event_id,
            action = %decision.action,
            current_nodes = decision.current_nodes,
            desired_nodes = decision.desired_nodes,
            reason = %decision.reason,
            "Scaling decision"
        ),
        ClusterEvent::DrainCompleted { node_id, forced } => info!(
            event_id = envelope.event_id,
            node_id = %node_id,
            forced,
            "Node drained"
        ),
        other => debug!(
            event_id = envelope.event_id,
            event_type = other.event_type(),
            node_id = ?other.node_id(),
            "Cluster event"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_logger_exits_on_shutdown() {
        let events = EventBus::default();
        let logger = EventLogger::new(&events);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(logger.run(rx));

        events.publish(ClusterEvent::DrainCancelled {
            node_id: "n1".into(),
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
