//! Heartbeat loop for reporting node health to the control plane.
//!
//! Each tick samples the local [`HealthMonitor`], turns the report into a
//! [`HeartbeatPayload`] and posts it signed. A node without a token (or whose
//! token was refused) registers itself first.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use fleet_events::HeartbeatPayload;
use fleet_health::{AlertEvent, Component, HealthMonitor, HealthReport, MetricsSource};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ControlPlaneClient, HeartbeatAck, HeartbeatOutcome, NodeRegistration};
use crate::config::Config;

/// Number of jobs currently running on this node.
///
/// Owned by whatever runs jobs; the heartbeat only reads it.
pub type ActiveJobs = Arc<AtomicU32>;

/// Failures logged at `warn` before escalating to `error`.
const WARN_FAILURES: u32 = 3;

/// Build the wire payload from a classified report.
///
/// Load averages can exceed the CPU count, so the CPU figure is capped at
/// 100 to stay a percentage.
pub fn build_payload(
    node_id: &str,
    report: &HealthReport,
    active_jobs: u32,
    capabilities: &[String],
    timestamp_ms: i64,
) -> HeartbeatPayload {
    let percent = |component| {
        report
            .component(component)
            .map(|c| c.value)
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
    };

    HeartbeatPayload {
        node_id: node_id.to_string(),
        cpu_usage: percent(Component::Cpu),
        memory_usage: percent(Component::Memory),
        active_jobs,
        capabilities: capabilities.to_vec(),
        timestamp: timestamp_ms,
        health: Some(report.status),
    }
}

fn log_alert(node_id: &str, event: &AlertEvent) {
    match event {
        AlertEvent::Raised {
            component,
            status,
            value,
            threshold,
        } => warn!(
            node_id,
            component = ?component,
            status = %status,
            value,
            threshold,
            "Health alert raised"
        ),
        AlertEvent::Resolved { component, value } => {
            info!(node_id, component = ?component, value, "Health alert resolved")
        }
    }
}

/// One node's heartbeat state: monitor, client and the job gauge.
pub struct Heartbeat<S> {
    registration: NodeRegistration,
    monitor: HealthMonitor<S>,
    client: ControlPlaneClient,
    active_jobs: ActiveJobs,
}

impl<S: MetricsSource> Heartbeat<S> {
    pub fn new(config: &Config, monitor: HealthMonitor<S>, client: ControlPlaneClient) -> Self {
        Self {
            registration: NodeRegistration::from_config(config),
            monitor,
            client,
            active_jobs: ActiveJobs::default(),
        }
    }

    pub fn with_active_jobs(mut self, active_jobs: ActiveJobs) -> Self {
        self.active_jobs = active_jobs;
        self
    }

    pub fn client(&self) -> &ControlPlaneClient {
        &self.client
    }

    /// Register if needed, then sample and send one heartbeat.
    pub async fn beat(&mut self) -> Result<HeartbeatAck> {
        if !self.client.has_token() {
            self.client.register(&self.registration).await?;
        }

        let (report, alerts) = self.monitor.sample().context("failed to sample host metrics")?;
        for alert in &alerts {
            log_alert(&self.registration.id, alert);
        }

        let payload = build_payload(
            &self.registration.id,
            &report,
            self.active_jobs.load(Ordering::Relaxed),
            &self.registration.capabilities,
            Utc::now().timestamp_millis(),
        );

        match self.client.send_heartbeat(&payload).await? {
            HeartbeatOutcome::Accepted(ack) => Ok(ack),
            HeartbeatOutcome::Unauthorized => {
                self.client.forget_token();
                anyhow::bail!("heartbeat token refused; re-registering on next tick")
            }
        }
    }
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop<S: MetricsSource>(
    config: Config,
    monitor: HealthMonitor<S>,
    client: ControlPlaneClient,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let heartbeat = Heartbeat::new(&config, monitor, client);
    run(heartbeat, &config, shutdown).await
}

/// Drive an already assembled [`Heartbeat`] until shutdown.
pub async fn run<S: MetricsSource>(
    mut heartbeat: Heartbeat<S>,
    config: &Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        node_id = %config.node_id,
        interval_secs = config.heartbeat_interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match heartbeat.beat().await {
                    Ok(ack) => {
                        consecutive_failures = 0;
                        debug!(
                            accepted = ack.accepted,
                            health = %ack.health,
                            status = %ack.status,
                            "Heartbeat acknowledged"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= WARN_FAILURES {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}
