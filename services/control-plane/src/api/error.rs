use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleet_events::EventError;
use fleet_signing::SignatureError;
use serde::Serialize;

use crate::priority::AdmissionError;
use crate::registry::RegistryError;
use crate::tokens::TokenError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleet-ci.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn too_many_requests(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::TOO_MANY_REQUESTS, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.request_id = request_id.into();
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

// =============================================================================
// Domain error mapping
// =============================================================================

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InsufficientScope { .. } => ApiError::forbidden("insufficient_scope", err.to_string()),
            TokenError::Malformed(_) => ApiError::unauthorized("malformed_token", err.to_string()),
            TokenError::Expired => ApiError::unauthorized("token_expired", err.to_string()),
            TokenError::Revoked => ApiError::unauthorized("token_revoked", err.to_string()),
            TokenError::UnknownToken | TokenError::InvalidSecret => {
                ApiError::unauthorized("invalid_token", err.to_string())
            }
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Malformed(_) => ApiError::bad_request("malformed_message", err.to_string()),
            SignatureError::Replay(_) => ApiError::conflict("replayed_message", err.to_string()),
            SignatureError::Expired { .. } | SignatureError::FutureTimestamp { .. } => {
                ApiError::unauthorized("stale_message", err.to_string())
            }
            SignatureError::InvalidSignature | SignatureError::EmptySecret => {
                ApiError::unauthorized("invalid_signature", err.to_string())
            }
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        ApiError::bad_request("invalid_payload", err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownNode(_) => ApiError::not_found("unknown_node", err.to_string()),
            RegistryError::InvalidRegistration(_) => {
                ApiError::bad_request("invalid_registration", err.to_string())
            }
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QuotaExceeded { .. } => {
                ApiError::too_many_requests("quota_exceeded", err.to_string())
            }
            AdmissionError::UnknownLevel(_) => ApiError::bad_request("unknown_priority", err.to_string()),
            AdmissionError::DuplicateJob(_) => ApiError::conflict("duplicate_job", err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_maps_to_429_retryable() {
        let err: ApiError = AdmissionError::QuotaExceeded {
            user_id: "u1".into(),
            active: 10,
            limit: 10,
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.problem.retryable);
        assert_eq!(err.problem.code, "quota_exceeded");
    }

    #[test]
    fn test_scope_maps_to_403() {
        let err: ApiError = TokenError::InsufficientScope {
            required: "heartbeat".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_problem_json_content_type() {
        let response = ApiError::not_found("unknown_node", "unknown node: n1")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_retry_after_marks_retryable() {
        let err = ApiError::internal("busy", "try later").with_retry_after_seconds(5);
        assert!(err.problem.retryable);
        assert_eq!(err.problem.retry_after_seconds, 5);
    }
}
