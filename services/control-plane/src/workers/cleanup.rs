use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_signing::SignedCommunication;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::registry::NodeRegistry;
use crate::tokens::TokenAuthManager;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    /// How long expired or revoked tokens are kept.
    pub token_retention: Duration,
    /// Heartbeat silence after which a node is marked unhealthy.
    pub node_stale_after: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            token_retention: Duration::from_secs(24 * 60 * 60),
            node_stale_after: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub nonces_pruned: usize,
    pub tokens_purged: usize,
    pub stale_nodes: Vec<String>,
}

pub struct CleanupWorker {
    signer: Arc<SignedCommunication>,
    tokens: Arc<TokenAuthManager>,
    registry: Arc<NodeRegistry>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(
        signer: Arc<SignedCommunication>,
        tokens: Arc<TokenAuthManager>,
        registry: Arc<NodeRegistry>,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            signer,
            tokens,
            registry,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.node_stale_after.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn run_once(&self) -> CleanupStats {
        let stats = CleanupStats {
            nonces_pruned: self.signer.prune_nonces(),
            tokens_purged: self.tokens.purge_expired(self.config.token_retention),
            stale_nodes: self
                .registry
                .mark_stale(self.config.node_stale_after, Utc::now()),
        };

        if !stats.stale_nodes.is_empty() {
            warn!(nodes = ?stats.stale_nodes, "Nodes stopped sending heartbeats");
        }
        if stats.nonces_pruned > 0 || stats.tokens_purged > 0 {
            info!(
                nonces_pruned = stats.nonces_pruned,
                tokens_purged = stats.tokens_purged,
                "Cleanup pass complete"
            );
        }
        stats
    }
}
