//! Cluster overview.

use axum::{extract::State, routing::get, Json, Router};
use fleet_events::ScalingDecision;
use fleet_health::ClusterHealthSummary;
use serde::Serialize;

use crate::circuit::CircuitStats;
use crate::drain::DrainEntry;
use crate::forwarder::ForwardStats;
use crate::priority::PriorityStats;
use crate::registry::NodeStatus;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(get_cluster))
}

#[derive(Debug, Default, Serialize)]
pub struct NodeCounts {
    pub total: usize,
    pub active: usize,
    pub draining: usize,
    pub offline: usize,
    pub healthy: usize,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub strategy: &'static str,
    pub nodes: NodeCounts,
    pub health: ClusterHealthSummary,
    pub circuits: Vec<CircuitStats>,
    pub drains: Vec<DrainEntry>,
    pub queue: PriorityStats,
    pub forwarding: ForwardStats,
    pub last_scaling_decision: Option<ScalingDecision>,
}

/// GET /v1/cluster
async fn get_cluster(State(state): State<AppState>) -> Json<ClusterResponse> {
    let nodes = state.registry().snapshot();

    let mut counts = NodeCounts {
        total: nodes.len(),
        ..Default::default()
    };
    for node in &nodes {
        match node.status {
            NodeStatus::Active => counts.active += 1,
            NodeStatus::Draining => counts.draining += 1,
            NodeStatus::Offline => counts.offline += 1,
        }
        if node.healthy {
            counts.healthy += 1;
        }
    }

    Json(ClusterResponse {
        strategy: state.scheduler().parts().balancer.strategy_name(),
        nodes: counts,
        health: ClusterHealthSummary::from_statuses(state.registry().health_statuses()),
        circuits: state.circuits().all_stats(),
        drains: state.drains().active_drains(),
        queue: state.priority().stats(),
        forwarding: state.forwarder().stats(),
        last_scaling_decision: state.autoscaler().last_decision(),
    })
}
