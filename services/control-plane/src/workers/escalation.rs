use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::priority::PriorityManager;

/// Periodically promotes jobs that waited past their tier's limit.
pub struct EscalationWorker {
    priority: Arc<PriorityManager>,
    interval: Duration,
}

impl EscalationWorker {
    pub fn new(priority: Arc<PriorityManager>, interval: Duration) -> Self {
        Self { priority, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting escalation worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Escalation worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One escalation sweep. Returns the number of jobs promoted.
    pub fn run_once(&self) -> usize {
        let escalated = self.priority.escalate().len();
        if escalated > 0 {
            debug!(escalated, "Escalation sweep complete");
        }
        escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::priority::{JobSubmission, PriorityConfig};

    #[tokio::test(start_paused = true)]
    async fn test_worker_escalates_waiting_jobs() {
        let priority =
            Arc::new(PriorityManager::new(PriorityConfig::default(), EventBus::default()).unwrap());
        priority.add_job(JobSubmission::new("j1", "u1", 3)).unwrap();

        let worker = EscalationWorker::new(priority.clone(), Duration::from_secs(5));
        assert_eq!(worker.run_once(), 0);

        // Past the normal tier's 300s limit.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(worker.run_once(), 1);
        assert_eq!(priority.get("j1").unwrap().current_level, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_on_shutdown() {
        let priority =
            Arc::new(PriorityManager::new(PriorityConfig::default(), EventBus::default()).unwrap());
        let worker = EscalationWorker::new(priority, Duration::from_secs(5));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tokio::time::advance(Duration::from_secs(12)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
