//! Node API endpoints.
//!
//! Registration and heartbeats. Both are called by node agents, never by
//! tenants.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use fleet_events::{HealthStatus, HeartbeatPayload};
use fleet_signing::SignedMessage;
use serde::Serialize;
use tracing::{debug, info};

use super::{authenticate, ensure_peer_allowed, ensure_sender, ensure_token_node, open_envelope};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::registry::{Node, NodeRegistration, NodeStatus};
use crate::state::AppState;
use crate::tokens::scopes;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register_node))
        .route("/heartbeat", post(heartbeat))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RegisterNodeResponse {
    pub node_id: String,
    /// Heartbeat token bound to the node. Shown once.
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub node_id: String,
    pub health: HealthStatus,
    pub status: NodeStatus,
}

impl From<&Node> for HeartbeatResponse {
    fn from(node: &Node) -> Self {
        Self {
            accepted: true,
            node_id: node.id.clone(),
            health: node.health,
            status: node.status,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Register a node.
///
/// POST /v1/nodes
///
/// The body is a [`SignedMessage`] whose payload is a [`NodeRegistration`]
/// signed by the node itself with the cluster secret. The response carries
/// a fresh heartbeat token bound to the node.
async fn register_node(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ctx: RequestContext,
    Json(message): Json<SignedMessage>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_peer_allowed(&state, peer, &ctx)?;
    let payload = open_envelope(&state, &ctx, &message)?;

    let registration: NodeRegistration = serde_json::from_str(&payload).map_err(|e| {
        ApiError::bad_request("invalid_registration", e.to_string())
            .with_request_id(ctx.request_id.clone())
    })?;
    ensure_sender(&ctx, &registration.id, &message)?;

    let node = state
        .registry()
        .register(registration)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let issued = state
        .tokens()
        .generate_token(Some(&node.id), [scopes::HEARTBEAT], None);
    info!(node_id = %node.id, token_id = %issued.token.id, "Issued heartbeat token");

    Ok((
        StatusCode::CREATED,
        Json(RegisterNodeResponse {
            node_id: node.id,
            token: issued.plaintext,
            token_id: issued.token.id,
            expires_at: issued.token.expires_at,
        }),
    ))
}

/// Process a node heartbeat.
///
/// POST /v1/nodes/heartbeat
///
/// Checks run in order: network policy on the peer, bearer token with the
/// `heartbeat` scope, envelope signature, then that the signer, the token
/// and the payload all name the same node.
async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ctx: RequestContext,
    Json(message): Json<SignedMessage>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    ensure_peer_allowed(&state, peer, &ctx)?;
    let token = authenticate(&state, &ctx, scopes::HEARTBEAT)?;
    let payload = open_envelope(&state, &ctx, &message)?;

    let heartbeat = HeartbeatPayload::from_json(&payload)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    ensure_sender(&ctx, &heartbeat.node_id, &message)?;
    ensure_token_node(&ctx, &heartbeat.node_id, &token)?;

    let node = state
        .registry()
        .ingest_heartbeat(&heartbeat)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    debug!(node_id = %node.id, health = %node.health, cpu = node.load.cpu_usage, "Heartbeat ingested");

    Ok(Json(HeartbeatResponse::from(&node)))
}
