//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Bearer token, if the request carried one. Never logged.
    pub bearer_token: Option<String>,
}

impl RequestContext {
    /// The bearer token, or 401.
    pub fn require_bearer(&self) -> Result<&str, ApiError> {
        self.bearer_token.as_deref().ok_or_else(|| {
            ApiError::unauthorized("missing_authorization", "Authorization Bearer token required")
                .with_request_id(self.request_id.clone())
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn bearer_from_headers(headers: &HeaderMap, request_id: &str) -> Result<Option<String>, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization Bearer token cannot be empty",
        )
        .with_request_id(request_id.to_string()));
    }
    Ok(Some(token.to_string()))
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let bearer_token = bearer_from_headers(&parts.headers, &request_id)?;

        Ok(Self {
            request_id,
            bearer_token,
        })
    }
}
