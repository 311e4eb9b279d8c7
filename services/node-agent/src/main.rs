//! Fleet Node Agent
//!
//! Runs on each worker host and keeps the control plane informed of the
//! node's health and load.
//!
//! ## Architecture
//!
//! - **Sampler**: reads host metrics through `sysinfo`
//! - **Health monitor**: classifies samples and tracks alerts
//! - **Heartbeat loop**: registers the node if needed, then reports signed
//!   heartbeats periodically

use anyhow::Result;
use fleet_health::{HealthMonitor, HealthThresholds};
use fleet_node_agent::{config::Config, heartbeat, ControlPlaneClient, SysinfoSource};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet node agent");
    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        advertise_addr = %config.advertise_addr,
        preissued_token = config.node_token.is_some(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = HealthMonitor::new(SysinfoSource::new(), HealthThresholds::default());
    let client = ControlPlaneClient::new(&config)?;

    let mut heartbeat_handle = tokio::spawn({
        let config = config.clone();
        async move { heartbeat::run_heartbeat_loop(config, monitor, client, shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            if let Err(e) = (&mut heartbeat_handle).await {
                error!(error = %e, "Heartbeat task panicked");
            }
        }
        result = &mut heartbeat_handle => {
            match result {
                Ok(Ok(())) => info!("Heartbeat loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Heartbeat loop error"),
                Err(e) => error!(error = %e, "Heartbeat task panicked"),
            }
        }
    }

    info!("Node agent shutdown complete");
    Ok(())
}
