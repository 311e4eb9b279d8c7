//! Event and payload type definitions.
//!
//! Wire payloads exchanged with nodes and with the external node-lifecycle
//! actuator use camelCase field names; internal event variants use snake_case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Circuit breaker
    pub const CIRCUIT_STATE_CHANGED: &str = "circuit.state_changed";

    // Node health
    pub const NODE_HEALTH_CHANGED: &str = "node.health_changed";

    // Priority
    pub const JOB_ESCALATED: &str = "job.escalated";

    // Autoscaling
    pub const SCALING_DECIDED: &str = "scaling.decided";

    // Drain
    pub const DRAIN_STARTED: &str = "drain.started";
    pub const DRAIN_PROGRESS: &str = "drain.progress";
    pub const DRAIN_COMPLETED: &str = "drain.completed";
    pub const DRAIN_CANCELLED: &str = "drain.cancelled";
}

// =============================================================================
// Shared Enums
// =============================================================================

/// Health classification of a node, a metric, or the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Rank used when folding statuses together.
    ///
    /// Unhealthy dominates degraded, degraded dominates unknown, unknown
    /// dominates healthy.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    /// Returns the more severe of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic allowed, failures counted.
    #[default]
    Closed,
    /// Traffic blocked until the recovery timeout elapses.
    Open,
    /// Probing: traffic allowed, a single failure reopens.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Drain lifecycle of a node. Active nodes have no drain entry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    Draining,
    ForceDraining,
    Drained,
}

impl std::fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DrainStatus::Draining => "draining",
            DrainStatus::ForceDraining => "force_draining",
            DrainStatus::Drained => "drained",
        };
        write!(f, "{}", s)
    }
}

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScalingAction::ScaleUp => "scale-up",
            ScalingAction::ScaleDown => "scale-down",
            ScalingAction::None => "none",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Wire Payloads
// =============================================================================

/// Periodic heartbeat sent by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: String,

    /// CPU usage percentage (0-100).
    pub cpu_usage: f64,

    /// Memory usage percentage (0-100).
    pub memory_usage: f64,

    pub active_jobs: u32,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Epoch milliseconds at which the node produced the heartbeat.
    pub timestamp: i64,

    /// Locally classified health, if the node runs a health monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

impl HeartbeatPayload {
    /// Decode and validate a heartbeat from JSON.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let payload: HeartbeatPayload = serde_json::from_str(json)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Encode the heartbeat as JSON.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reject payloads with impossible values.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.node_id.is_empty() {
            return Err(EventError::InvalidPayload("nodeId must not be empty".into()));
        }
        for (field, value) in [("cpuUsage", self.cpu_usage), ("memoryUsage", self.memory_usage)] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(EventError::InvalidPayload(format!(
                    "{} must be a percentage, got {}",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// Aggregate metrics a scaling decision was based on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScalingMetrics {
    pub queue_depth: f64,
    pub cpu_percent: f64,
    pub response_time_ms: f64,
    pub current_nodes: u32,
}

/// Output of one autoscaler evaluation.
///
/// `desired_nodes` is the target the node-lifecycle actuator reconciles toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub reason: String,
    pub current_nodes: u32,
    pub desired_nodes: u32,
    pub metrics: ScalingMetrics,
    pub timestamp: DateTime<Utc>,
}

impl ScalingDecision {
    pub fn is_none(&self) -> bool {
        self.action == ScalingAction::None
    }
}

// =============================================================================
// Cluster Events
// =============================================================================

/// Observable state transitions published by control-plane components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    CircuitStateChanged {
        node_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    NodeHealthChanged {
        node_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    JobEscalated {
        job_id: String,
        user_id: String,
        from_level: u32,
        to_level: u32,
    },
    ScalingDecided(ScalingDecision),
    DrainStarted {
        node_id: String,
        initial_jobs: u32,
        timeout_ms: u64,
        initiated_by: String,
        reason: Option<String>,
    },
    DrainProgress {
        node_id: String,
        remaining_jobs: u32,
        percent: f64,
    },
    DrainCompleted {
        node_id: String,
        forced: bool,
    },
    DrainCancelled {
        node_id: String,
    },
}

impl ClusterEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClusterEvent::CircuitStateChanged { .. } => event_types::CIRCUIT_STATE_CHANGED,
            ClusterEvent::NodeHealthChanged { .. } => event_types::NODE_HEALTH_CHANGED,
            ClusterEvent::JobEscalated { .. } => event_types::JOB_ESCALATED,
            ClusterEvent::ScalingDecided(_) => event_types::SCALING_DECIDED,
            ClusterEvent::DrainStarted { .. } => event_types::DRAIN_STARTED,
            ClusterEvent::DrainProgress { .. } => event_types::DRAIN_PROGRESS,
            ClusterEvent::DrainCompleted { .. } => event_types::DRAIN_COMPLETED,
            ClusterEvent::DrainCancelled { .. } => event_types::DRAIN_CANCELLED,
        }
    }

    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ClusterEvent::CircuitStateChanged { node_id, .. }
            | ClusterEvent::NodeHealthChanged { node_id, .. }
            | ClusterEvent::DrainStarted { node_id, .. }
            | ClusterEvent::DrainProgress { node_id, .. }
            | ClusterEvent::DrainCompleted { node_id, .. }
            | ClusterEvent::DrainCancelled { node_id } => Some(node_id),
            ClusterEvent::JobEscalated { .. } | ClusterEvent::ScalingDecided(_) => None,
        }
    }
}
