//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use v1::{JobCompletion, RegisterNodeResponse};

/// Create the main API router with all routes and middleware.
///
/// Handlers read the peer address, so serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
