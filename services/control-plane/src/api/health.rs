//! Health check endpoints.
//!
//! Readiness reflects the worst node status across the fleet.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use fleet_events::HealthStatus;
use fleet_health::ClusterHealthSummary;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok", "degraded" or "unavailable".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterStatus>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ClusterStatus {
    pub status: HealthStatus,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub total: usize,
}

impl From<ClusterHealthSummary> for ClusterStatus {
    fn from(summary: ClusterHealthSummary) -> Self {
        Self {
            status: summary.status,
            healthy: summary.healthy,
            degraded: summary.degraded,
            unhealthy: summary.unhealthy,
            unknown: summary.unknown,
            total: summary.total,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, cluster: Option<ClusterStatus>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        cluster,
    }
}

/// The process is up.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// 503 when the fleet as a whole is unhealthy.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let summary = ClusterHealthSummary::from_statuses(state.registry().health_statuses());

    let (code, status) = match summary.status {
        HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        HealthStatus::Degraded => (StatusCode::OK, "degraded"),
        HealthStatus::Healthy | HealthStatus::Unknown => (StatusCode::OK, "ok"),
    };
    (code, Json(response(status, Some(summary.into()))))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
