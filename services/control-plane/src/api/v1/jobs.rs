//! Job ingestion endpoints.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use fleet_signing::SignedMessage;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{authenticate, ensure_peer_allowed, ensure_sender, ensure_token_node, open_envelope};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::priority::JobSubmission;
use crate::state::AppState;
use crate::tokens::scopes;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_job))
        .route("/{job_id}/complete", post(complete_job))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobAcceptedResponse {
    pub job_id: String,
    pub user_id: String,
    pub priority: u32,
    /// Jobs queued across all tiers after admission.
    pub queue_depth: usize,
}

/// Signed payload a node sends when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub node_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobCompletedResponse {
    pub job_id: String,
    /// False when the job was not tracked (already completed or unknown).
    pub released: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// Admit a job.
///
/// POST /v1/jobs
///
/// 202 when admitted, 429 when the user is at quota.
async fn submit_job(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ctx: RequestContext,
    Json(submission): Json<JobSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_peer_allowed(&state, peer, &ctx)?;

    if submission.job_id.trim().is_empty() || submission.user_id.trim().is_empty() {
        return Err(
            ApiError::bad_request("invalid_job", "job_id and user_id must not be empty")
                .with_request_id(ctx.request_id),
        );
    }

    let entry = state
        .scheduler()
        .submit(submission)
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    info!(
        job_id = %entry.job_id,
        user_id = %entry.user_id,
        priority = entry.current_level,
        request_id = %ctx.request_id,
        "Job accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAcceptedResponse {
            job_id: entry.job_id,
            user_id: entry.user_id,
            priority: entry.current_level,
            queue_depth: state.priority().queue_depth(),
        }),
    ))
}

/// Report that a job finished on a node.
///
/// POST /v1/jobs/{job_id}/complete
///
/// Authenticated like a heartbeat. Releases the job's priority slot and the
/// node's load, and advances any drain on the node.
async fn complete_job(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
    Json(message): Json<SignedMessage>,
) -> Result<Json<JobCompletedResponse>, ApiError> {
    ensure_peer_allowed(&state, peer, &ctx)?;
    let token = authenticate(&state, &ctx, scopes::HEARTBEAT)?;
    let payload = open_envelope(&state, &ctx, &message)?;

    let completion: JobCompletion = serde_json::from_str(&payload).map_err(|e| {
        ApiError::bad_request("invalid_payload", e.to_string()).with_request_id(ctx.request_id.clone())
    })?;
    ensure_sender(&ctx, &completion.node_id, &message)?;
    ensure_token_node(&ctx, &completion.node_id, &token)?;

    if !state.registry().contains(&completion.node_id) {
        return Err(ApiError::not_found(
            "unknown_node",
            format!("unknown node: {}", completion.node_id),
        )
        .with_request_id(ctx.request_id));
    }

    let released = state
        .scheduler()
        .job_finished(&job_id, &completion.node_id)
        .is_some();

    Ok(Json(JobCompletedResponse { job_id, released }))
}
