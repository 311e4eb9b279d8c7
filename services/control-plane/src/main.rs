//! Fleet Control Plane
//!
//! Coordinates a fleet of CI worker nodes: admits jobs by priority, places
//! them on healthy nodes, isolates failing nodes, drains nodes on request
//! and recommends fleet size changes.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_control_plane::{
    api, config,
    state::AppState,
    workers::{
        AutoscaleWorker, CleanupWorker, CleanupWorkerConfig, DispatchWorker, EscalationWorker,
        EventLogger,
    },
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet control plane");
    info!(
        listen_addr = %config.listen_addr,
        strategy = ?config.strategy,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let state = AppState::from_config(&config).context("failed to build control plane state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let logger = EventLogger::new(state.events());
    workers.push(("event logger", tokio::spawn(logger.run(shutdown_rx.clone()))));

    let escalation = EscalationWorker::new(state.priority().clone(), config.escalation_interval);
    workers.push(("escalation", tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { escalation.run(shutdown_rx).await }
    })));

    let autoscale = AutoscaleWorker::new(
        state.autoscaler().clone(),
        state.registry().clone(),
        state.priority().clone(),
        state.forwarder().clone(),
        config.autoscale_interval,
    );
    workers.push(("autoscale", tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { autoscale.run(shutdown_rx).await }
    })));

    let cleanup = CleanupWorker::new(
        state.signer().clone(),
        state.tokens().clone(),
        state.registry().clone(),
        CleanupWorkerConfig {
            interval: config.cleanup_interval,
            token_retention: config.token_retention,
            node_stale_after: config.node_stale_after,
        },
    );
    workers.push(("cleanup", tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { cleanup.run(shutdown_rx).await }
    })));

    let dispatch = DispatchWorker::new(state.scheduler().clone(), config.dispatch_interval);
    workers.push(("dispatch", tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { dispatch.run(shutdown_rx).await }
    })));

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in workers {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(worker = name, error = %e, "Worker did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
