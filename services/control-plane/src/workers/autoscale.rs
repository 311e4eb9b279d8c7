use std::sync::Arc;
use std::time::Duration;

use fleet_events::{ScalingDecision, ScalingMetrics};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::autoscaler::AutoScaler;
use crate::forwarder::RequestForwarder;
use crate::priority::PriorityManager;
use crate::registry::{NodeRegistry, NodeStatus};

/// Samples cluster load and feeds it to the autoscaler.
pub struct AutoscaleWorker {
    autoscaler: Arc<AutoScaler>,
    registry: Arc<NodeRegistry>,
    priority: Arc<PriorityManager>,
    forwarder: Arc<RequestForwarder>,
    interval: Duration,
}

impl AutoscaleWorker {
    pub fn new(
        autoscaler: Arc<AutoScaler>,
        registry: Arc<NodeRegistry>,
        priority: Arc<PriorityManager>,
        forwarder: Arc<RequestForwarder>,
        interval: Duration,
    ) -> Self {
        Self {
            autoscaler,
            registry,
            priority,
            forwarder,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting autoscale worker"
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
                        info!("Autoscale worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Current load: queue depth, mean CPU of healthy nodes, mean forward
    /// latency and the number of nodes not offline.
    pub fn sample(&self) -> ScalingMetrics {
        let nodes = self.registry.snapshot();
        let in_service: Vec<_> = nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Offline)
            .collect();
        let healthy_cpu: Vec<f64> = in_service
            .iter()
            .filter(|n| n.healthy)
            .map(|n| n.load.cpu_usage)
            .collect();
        let cpu_percent = if healthy_cpu.is_empty() {
            0.0
        } else {
            healthy_cpu.iter().sum::<f64>() / healthy_cpu.len() as f64
        };

        ScalingMetrics {
            queue_depth: self.priority.queue_depth() as f64,
            cpu_percent,
            response_time_ms: self.forwarder.mean_response_time_ms(),
            current_nodes: in_service.len() as u32,
        }
    }

    pub fn run_once(&self) -> ScalingDecision {
        let sample = self.sample();
        let decision = self.autoscaler.evaluate(sample);
        debug!(
            action = %decision.action,
            queue_depth = sample.queue_depth,
            cpu_percent = sample.cpu_percent,
            reason = %decision.reason,
            "Autoscale evaluation"
        );
        decision
    }
}
