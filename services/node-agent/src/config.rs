//! Configuration for the node agent.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Pre-issued heartbeat token. When absent the agent registers itself
    /// and uses the token the control plane returns.
    pub node_token: Option<String>,

    /// Shared secret used to sign every message to the control plane.
    pub cluster_secret: String,

    /// Address the control plane forwards work to.
    pub advertise_addr: SocketAddr,

    pub region: String,
    pub weight: f64,
    pub max_jobs: u32,
    pub max_connections: u32,

    pub capabilities: Vec<String>,

    pub heartbeat_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let node_id = match lookup("FLEET_NODE_ID").filter(|s| !s.trim().is_empty()) {
            Some(id) => id,
            None => bail!("FLEET_NODE_ID must be set"),
        };

        let control_plane_url = var("FLEET_CONTROL_PLANE_URL", "http://127.0.0.1:8080")
            .trim_end_matches('/')
            .to_string();

        let node_token = lookup("FLEET_NODE_TOKEN").filter(|s| !s.is_empty());

        let cluster_secret = match lookup("FLEET_CLUSTER_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => bail!("FLEET_CLUSTER_SECRET must be set"),
        };

        let advertise_addr = var("FLEET_NODE_ADDRESS", "127.0.0.1:9090")
            .parse()
            .context("FLEET_NODE_ADDRESS must be a socket address")?;

        let region = var("FLEET_NODE_REGION", "");

        let weight: f64 = var("FLEET_NODE_WEIGHT", "1.0")
            .parse()
            .context("FLEET_NODE_WEIGHT must be a number")?;
        if !weight.is_finite() || weight <= 0.0 {
            bail!("FLEET_NODE_WEIGHT must be positive, got {}", weight);
        }

        let max_jobs: u32 = var("FLEET_NODE_MAX_JOBS", "4")
            .parse()
            .context("FLEET_NODE_MAX_JOBS must be an integer")?;

        let max_connections: u32 = var("FLEET_NODE_MAX_CONNECTIONS", "100")
            .parse()
            .context("FLEET_NODE_MAX_CONNECTIONS must be an integer")?;

        let capabilities = var("FLEET_CAPABILITIES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let heartbeat_secs: u64 = var("FLEET_HEARTBEAT_INTERVAL", "10")
            .parse()
            .context("FLEET_HEARTBEAT_INTERVAL must be an integer")?;
        if heartbeat_secs == 0 {
            bail!("FLEET_HEARTBEAT_INTERVAL must be at least 1 second");
        }

        let log_level = var("FLEET_LOG_LEVEL", "info");

        Ok(Self {
            node_id,
            control_plane_url,
            node_token,
            cluster_secret,
            advertise_addr,
            region,
            weight,
            max_jobs,
            max_connections,
            capabilities,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            log_level,
        })
    }
}
