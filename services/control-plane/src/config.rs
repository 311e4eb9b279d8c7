use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_networking::{parse_allowlist, IpMatcher};
use thiserror::Error;

use crate::autoscaler::AutoscalerConfig;
use crate::balancer::StrategyKind;
use crate::circuit::CircuitBreakerConfig;
use crate::drain::DEFAULT_DRAIN_TIMEOUT;
use crate::forwarder::ForwarderConfig;
use crate::policy::{NetworkPolicyConfig, TlsPolicy};
use crate::priority::PriorityConfig;
use crate::tokens::DEFAULT_TOKEN_TTL;

/// A component was constructed with settings it cannot run under.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {component} configuration: {reason}")]
pub struct ConfigError {
    pub component: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(component: &'static str, reason: impl Into<String>) -> Self {
        Self {
            component,
            reason: reason.into(),
        }
    }
}

const DEV_CLUSTER_SECRET: &str = "fleet-dev-cluster-secret";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// Shared HMAC secret for signed messages and token hashing.
    pub cluster_secret: String,
    pub strategy: StrategyKind,
    pub network_policy: NetworkPolicyConfig,
    pub circuit: CircuitBreakerConfig,
    pub priority: PriorityConfig,
    pub autoscaler: AutoscalerConfig,
    pub forwarder: ForwarderConfig,
    pub drain_timeout: Duration,
    pub token_ttl: Duration,
    /// How long expired or revoked tokens are kept before purging.
    pub token_retention: Duration,
    pub escalation_interval: Duration,
    pub autoscale_interval: Duration,
    pub cleanup_interval: Duration,
    pub dispatch_interval: Duration,
    pub node_stale_after: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let listen_addr = var("FLEET_LISTEN_ADDR", "127.0.0.1:8080")
            .parse()
            .context("FLEET_LISTEN_ADDR must be a socket address")?;

        let log_level = var("FLEET_LOG_LEVEL", "info");

        let dev_mode = lookup("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let cluster_secret = match lookup("FLEET_CLUSTER_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None if dev_mode => DEV_CLUSTER_SECRET.to_string(),
            None => bail!("FLEET_CLUSTER_SECRET must be set outside dev mode"),
        };

        let strategy: StrategyKind = var("FLEET_BALANCING_STRATEGY", "least-connections")
            .parse()
            .map_err(anyhow::Error::msg)
            .context("FLEET_BALANCING_STRATEGY is not a known strategy")?;

        let allowlist: Vec<IpMatcher> = parse_allowlist(&var("FLEET_ALLOWED_IPS", ""))
            .context("FLEET_ALLOWED_IPS must be comma-separated IPs or CIDRs")?;

        let require_tls = lookup("FLEET_REQUIRE_TLS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let network_policy = NetworkPolicyConfig {
            enforce_allowlist: !allowlist.is_empty(),
            allowlist,
            tls: TlsPolicy {
                required: require_tls,
                ..Default::default()
            },
            ..Default::default()
        };

        let autoscaler = AutoscalerConfig {
            min_nodes: parse_u32(&lookup, "FLEET_MIN_NODES", 1)?,
            max_nodes: parse_u32(&lookup, "FLEET_MAX_NODES", 10)?,
            ..Default::default()
        };
        if autoscaler.min_nodes > autoscaler.max_nodes {
            bail!(
                "FLEET_MIN_NODES ({}) exceeds FLEET_MAX_NODES ({})",
                autoscaler.min_nodes,
                autoscaler.max_nodes
            );
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            cluster_secret,
            strategy,
            network_policy,
            circuit: CircuitBreakerConfig::default(),
            priority: PriorityConfig::default(),
            autoscaler,
            forwarder: ForwarderConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            token_ttl: DEFAULT_TOKEN_TTL,
            token_retention: Duration::from_secs(24 * 60 * 60),
            escalation_interval: parse_ms(&lookup, "FLEET_ESCALATION_INTERVAL_MS", 5_000)?,
            autoscale_interval: parse_ms(&lookup, "FLEET_AUTOSCALE_INTERVAL_MS", 30_000)?,
            cleanup_interval: Duration::from_secs(60),
            dispatch_interval: Duration::from_millis(500),
            node_stale_after: parse_ms(&lookup, "FLEET_NODE_STALE_AFTER_MS", 90_000)?,
        })
    }
}

fn parse_u32<F>(lookup: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be an integer", key)),
        None => Ok(default),
    }
}

fn parse_ms<F>(lookup: &F, key: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be an integer", key))?,
        None => default_ms,
    };
    if ms == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_dev_defaults() {
        let config = config_from(&[("FLEET_DEV", "true")]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.cluster_secret, DEV_CLUSTER_SECRET);
        assert_eq!(config.strategy, StrategyKind::LeastConnections);
        assert!(!config.network_policy.enforce_allowlist);
        assert_eq!(config.escalation_interval, Duration::from_secs(5));
        assert_eq!(config.autoscale_interval, Duration::from_secs(30));
        assert_eq!(config.autoscaler.min_nodes, 1);
        assert_eq!(config.autoscaler.max_nodes, 10);
    }

    #[test]
    fn test_secret_required_outside_dev() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("FLEET_CLUSTER_SECRET"));

        let config = config_from(&[("FLEET_CLUSTER_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.cluster_secret, "s3cret");
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("FLEET_CLUSTER_SECRET", "s"),
            ("FLEET_BALANCING_STRATEGY", "weighted_round_robin"),
            ("FLEET_ALLOWED_IPS", "10.0.0.0/8, 192.168.1.5"),
            ("FLEET_REQUIRE_TLS", "1"),
            ("FLEET_MIN_NODES", "2"),
            ("FLEET_MAX_NODES", "4"),
            ("FLEET_NODE_STALE_AFTER_MS", "1500"),
        ])
        .unwrap();

        assert_eq!(config.strategy, StrategyKind::WeightedRoundRobin);
        assert!(config.network_policy.enforce_allowlist);
        assert_eq!(config.network_policy.allowlist.len(), 2);
        assert!(config.network_policy.tls.required);
        assert_eq!(config.autoscaler.min_nodes, 2);
        assert_eq!(config.autoscaler.max_nodes, 4);
        assert_eq!(config.node_stale_after, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = ("FLEET_CLUSTER_SECRET", "s");

        let err = config_from(&[base, ("FLEET_MIN_NODES", "two")]).unwrap_err();
        assert_eq!(err.to_string(), "FLEET_MIN_NODES must be an integer");

        assert!(config_from(&[base, ("FLEET_MIN_NODES", "5"), ("FLEET_MAX_NODES", "3")]).is_err());
        assert!(config_from(&[base, ("FLEET_ALLOWED_IPS", "10.0.0.0/99")]).is_err());
        assert!(config_from(&[base, ("FLEET_BALANCING_STRATEGY", "random")]).is_err());
        assert!(config_from(&[base, ("FLEET_ESCALATION_INTERVAL_MS", "0")]).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("circuit", "failure_threshold must be >= 1");
        assert_eq!(
            err.to_string(),
            "invalid circuit configuration: failure_threshold must be >= 1"
        );
    }
}
