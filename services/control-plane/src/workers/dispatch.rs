use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::scheduler::{Scheduler, SchedulerError};

/// Dispatches queued jobs while there is work and somewhere to run it.
pub struct DispatchWorker {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    /// Upper bound on dispatch attempts per pass.
    max_per_pass: usize,
}

impl DispatchWorker {
    pub fn new(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            max_per_pass: 64,
        }
    }

    pub fn with_max_per_pass(mut self, max_per_pass: usize) -> Self {
        self.max_per_pass = max_per_pass.max(1);
        self
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting dispatch worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch until the queue is empty, tiers are full, or no node can
    /// take the next job. Returns the number of jobs handed out.
    pub async fn run_once(&self) -> usize {
        let mut dispatched = 0;
        for _ in 0..self.max_per_pass {
            match self.scheduler.dispatch_next().await {
                Ok(Some(_)) => dispatched += 1,
                Ok(None) => break,
                Err(SchedulerError::NoEligibleNode(job_id)) => {
                    debug!(job_id = %job_id, "No capacity for queued job");
                    break;
                }
                Err(e) => warn!(error = %e, "Dispatch attempt failed"),
            }
        }
        if dispatched > 0 {
            debug!(dispatched, "Dispatch pass complete");
        }
        dispatched
    }
}
