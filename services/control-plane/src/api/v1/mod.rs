//! API v1 routes.
//!
//! Internal surface used by node agents and the job ingestion path.

mod cluster;
mod jobs;
mod nodes;

pub use jobs::JobCompletion;
pub use nodes::RegisterNodeResponse;

use std::net::SocketAddr;

use axum::Router;
use fleet_signing::SignedMessage;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::tokens::ValidatedToken;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::routes())
        .nest("/jobs", jobs::routes())
        .nest("/cluster", cluster::routes())
}

// =============================================================================
// Shared request checks
// =============================================================================

/// Reject peers the network policy does not admit.
fn ensure_peer_allowed(state: &AppState, peer: SocketAddr, ctx: &RequestContext) -> Result<(), ApiError> {
    let result = state.policy().check_peer(peer.ip(), peer.port());
    if result.allowed {
        return Ok(());
    }
    Err(ApiError::forbidden(
        "network_policy_denied",
        result.reason.unwrap_or_else(|| "denied by network policy".to_string()),
    )
    .with_request_id(ctx.request_id.clone()))
}

/// Validate the bearer token for `scope`.
fn authenticate(state: &AppState, ctx: &RequestContext, scope: &str) -> Result<ValidatedToken, ApiError> {
    let token = ctx.require_bearer()?;
    state
        .tokens()
        .validate(token, Some(scope))
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))
}

/// Verify a signed envelope and return its payload.
fn open_envelope(state: &AppState, ctx: &RequestContext, message: &SignedMessage) -> Result<String, ApiError> {
    state
        .signer()
        .verify(message)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))
}

/// The message must be signed by `node_id` itself.
fn ensure_sender(ctx: &RequestContext, node_id: &str, message: &SignedMessage) -> Result<(), ApiError> {
    if message.sender_id == node_id {
        return Ok(());
    }
    Err(ApiError::forbidden(
        "sender_mismatch",
        format!("message signed by {} but concerns {}", message.sender_id, node_id),
    )
    .with_request_id(ctx.request_id.clone()))
}

/// The token must be bound to `node_id`.
fn ensure_token_node(ctx: &RequestContext, node_id: &str, token: &ValidatedToken) -> Result<(), ApiError> {
    match token.node_id.as_deref() {
        Some(bound) if bound == node_id => Ok(()),
        Some(bound) => Err(ApiError::forbidden(
            "token_node_mismatch",
            format!("token is bound to {}, not {}", bound, node_id),
        )
        .with_request_id(ctx.request_id.clone())),
        None => Err(ApiError::forbidden("unbound_token", "token is not bound to a node")
            .with_request_id(ctx.request_id.clone())),
    }
}
