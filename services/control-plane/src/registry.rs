//! Node registry.
//!
//! Holds per-node metadata (capacity, capabilities, status) and the live load
//! snapshot fed by heartbeats. Other components read cloned snapshots and
//! never hold the registry lock across their own work.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{ClusterEvent, HealthStatus, HeartbeatPayload};
use fleet_health::HealthThresholds;
use fleet_networking::TlsVersion;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Heartbeat or update for a node that was never registered.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

/// Static capacity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub max_connections: u32,
    pub max_jobs: u32,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_jobs: 4,
        }
    }
}

/// Live load of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeLoad {
    pub active_connections: u32,
    pub active_jobs: u32,
    /// Percent, 0-100.
    pub cpu_usage: f64,
    /// Percent, 0-100.
    pub memory_usage: f64,
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Active,
    Draining,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// TLS properties of the control plane's connection to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    pub version: TlsVersion,
    pub cert_verified: bool,
}

/// A worker node as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub address: SocketAddr,
    pub region: String,
    /// Operator-assigned weight, 0-10.
    pub weight: f64,
    pub capacity: NodeCapacity,
    pub load: NodeLoad,
    pub capabilities: BTreeSet<String>,
    /// False when unhealthy or when heartbeats stopped.
    pub healthy: bool,
    pub health: HealthStatus,
    pub status: NodeStatus,
    pub tls: Option<TlsInfo>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Node {
    /// Base URL for HTTP calls to the node.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.address)
    }

    pub fn has_capacity(&self) -> bool {
        self.load.active_connections < self.capacity.max_connections
            && self.load.active_jobs < self.capacity.max_jobs
    }

    /// Healthy and below capacity.
    pub fn is_eligible(&self) -> bool {
        self.healthy && self.has_capacity()
    }

    /// `active_connections / max_connections`, 1.0 for a zero-capacity node.
    pub fn connection_ratio(&self) -> f64 {
        if self.capacity.max_connections == 0 {
            return 1.0;
        }
        f64::from(self.load.active_connections) / f64::from(self.capacity.max_connections)
    }

    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }
}

/// Registration request for a node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeRegistration {
    pub id: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tls: Option<TlsInfo>,
}

fn default_weight() -> f64 {
    1.0
}

impl NodeRegistration {
    pub fn new(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
            region: String::new(),
            weight: default_weight(),
            capacity: NodeCapacity::default(),
            capabilities: BTreeSet::new(),
            tls: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_capacity(mut self, max_connections: u32, max_jobs: u32) -> Self {
        self.capacity = NodeCapacity {
            max_connections,
            max_jobs,
        };
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "node id must not be empty".into(),
            ));
        }
        if !self.weight.is_finite() || !(0.0..=10.0).contains(&self.weight) {
            return Err(RegistryError::InvalidRegistration(format!(
                "weight {} outside 0-10",
                self.weight
            )));
        }
        Ok(())
    }
}

/// Registry of known nodes.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
    thresholds: HealthThresholds,
    events: EventBus,
}

impl NodeRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            thresholds: HealthThresholds::default(),
            events,
        }
    }

    /// Register a node, or update the static fields of an existing one.
    ///
    /// Live load and health survive re-registration.
    pub fn register(&self, registration: NodeRegistration) -> Result<Node, RegistryError> {
        registration.validate()?;

        let mut nodes = self.nodes.write();
        let node = match nodes.get_mut(&registration.id) {
            Some(existing) => {
                existing.address = registration.address;
                existing.region = registration.region;
                existing.weight = registration.weight;
                existing.capacity = registration.capacity;
                existing.capabilities = registration.capabilities;
                existing.tls = registration.tls;
                debug!(node_id = %existing.id, "Node re-registered");
                existing.clone()
            }
            None => {
                let node = Node {
                    id: registration.id.clone(),
                    address: registration.address,
                    region: registration.region,
                    weight: registration.weight,
                    capacity: registration.capacity,
                    load: NodeLoad::default(),
                    capabilities: registration.capabilities,
                    // Trusted until heartbeats say otherwise.
                    healthy: true,
                    health: HealthStatus::Unknown,
                    status: NodeStatus::Active,
                    tls: registration.tls,
                    last_heartbeat: None,
                };
                info!(node_id = %node.id, address = %node.address, "Node registered");
                nodes.insert(node.id.clone(), node.clone());
                node
            }
        };
        Ok(node)
    }

    /// Apply a heartbeat to a registered node.
    pub fn ingest_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<Node, RegistryError> {
        self.ingest_heartbeat_at(heartbeat, Utc::now())
    }

    pub fn ingest_heartbeat_at(
        &self,
        heartbeat: &HeartbeatPayload,
        now: DateTime<Utc>,
    ) -> Result<Node, RegistryError> {
        let health = heartbeat.health.unwrap_or_else(|| {
            self.thresholds
                .cpu
                .classify(heartbeat.cpu_usage)
                .worst(self.thresholds.memory.classify(heartbeat.memory_usage))
        });

        let (node, previous) = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(&heartbeat.node_id)
                .ok_or_else(|| RegistryError::UnknownNode(heartbeat.node_id.clone()))?;

            let previous = node.health;
            node.load.cpu_usage = heartbeat.cpu_usage;
            node.load.memory_usage = heartbeat.memory_usage;
            node.load.active_jobs = heartbeat.active_jobs;
            if !heartbeat.capabilities.is_empty() {
                node.capabilities = heartbeat.capabilities.iter().cloned().collect();
            }
            node.health = health;
            node.healthy = health != HealthStatus::Unhealthy;
            node.last_heartbeat = Some(now);
            (node.clone(), previous)
        };

        if previous != health {
            info!(node_id = %node.id, from = %previous, to = %health, "Node health changed");
            self.events.publish(ClusterEvent::NodeHealthChanged {
                node_id: node.id.clone(),
                from: previous,
                to: health,
            });
        }
        Ok(node)
    }

    /// Flag nodes whose last heartbeat is older than `stale_after`.
    ///
    /// Returns the ids newly marked unhealthy. Nodes that never sent a
    /// heartbeat are left alone.
    pub fn mark_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> Vec<String> {
        let Ok(window) = chrono::Duration::from_std(stale_after) else {
            return Vec::new();
        };

        let mut flipped = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for node in nodes.values_mut() {
                let Some(last) = node.last_heartbeat else {
                    continue;
                };
                if now - last > window && node.health != HealthStatus::Unknown {
                    flipped.push((node.id.clone(), node.health));
                    node.health = HealthStatus::Unknown;
                    node.healthy = false;
                }
            }
        }

        for (node_id, from) in &flipped {
            warn!(node_id = %node_id, "Node heartbeat stale");
            self.events.publish(ClusterEvent::NodeHealthChanged {
                node_id: node_id.clone(),
                from: *from,
                to: HealthStatus::Unknown,
            });
        }
        flipped.into_iter().map(|(id, _)| id).collect()
    }

    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        if node.status != status {
            info!(node_id = %node_id, from = %node.status, to = %status, "Node status changed");
            node.status = status;
        }
        Ok(())
    }

    pub fn remove(&self, node_id: &str) -> Option<Node> {
        let removed = self.nodes.write().remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "Node removed");
        }
        removed
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// All nodes, ordered by id.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn list(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|n| n.id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Count a job (and its connection) against a node.
    pub fn job_started(&self, node_id: &str) -> Result<u32, RegistryError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        node.load.active_jobs += 1;
        node.load.active_connections += 1;
        Ok(node.load.active_jobs)
    }

    /// Release a job slot, returning the jobs still running on the node.
    pub fn job_finished(&self, node_id: &str) -> Result<u32, RegistryError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        node.load.active_jobs = node.load.active_jobs.saturating_sub(1);
        node.load.active_connections = node.load.active_connections.saturating_sub(1);
        Ok(node.load.active_jobs)
    }

    /// Health of every node that is not offline.
    pub fn health_statuses(&self) -> Vec<HealthStatus> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status != NodeStatus::Offline)
            .map(|n| n.health)
            .collect()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}
