//! Forwarding calls to nodes.
//!
//! Each attempt runs under a timeout; on expiry the in-flight request future
//! is dropped, which closes the connection. Transport failures are retried
//! with capped exponential backoff and jitter. Any HTTP response, whatever
//! its status, ends the retry loop and is returned to the caller.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit::{CircuitBreakerManager, CircuitOpenError};

/// Status codes callers should treat as retryable.
pub const RETRYABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// `min(base * 2^(attempt-1) + jitter * base * 0.5, cap)` for `attempt >= 1`
/// and `jitter` in `[0, 1)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let base_ms = base.as_millis() as f64;
    let delay_ms = base_ms * f64::from(1u32 << exp) + jitter * base_ms * 0.5;
    Duration::from_millis(delay_ms as u64).min(cap)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every attempt against one target failed.
    #[error("{target_url} failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        target_url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("all targets failed: {}", format_failures(.0))]
    AllTargetsFailed(Vec<TargetFailure>),

    #[error("no targets to forward to")]
    NoTargets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub node_id: String,
    pub reason: String,
}

fn format_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.node_id, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Value of `x-forwarded-by`.
    pub forwarded_by: String,
    /// Successful calls in the rolling response-time mean.
    pub latency_window: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            forwarded_by: "control-plane".to_string(),
            latency_window: 100,
        }
    }
}

/// Node a call is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub node_id: String,
    pub base_url: String,
}

impl ForwardTarget {
    pub fn new(node_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            base_url: base_url.into(),
        }
    }
}

/// A call to forward. Unset limits fall back to the forwarder config.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub path: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl ForwardRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: Vec::new(),
            body: None,
            timeout: None,
            max_retries: None,
            retry_delay: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post_json(path: impl Into<String>, body: impl Into<String>) -> Self {
        let mut request = Self::new(Method::POST, path);
        request
            .headers
            .push(("content-type".into(), "application/json".into()));
        request.body = Some(body.into());
        request
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(retry_delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub target_url: String,
    pub node_id: String,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ForwardResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Forwarding counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwardStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_attempts: u64,
    pub retries: u64,
    pub fallbacks_used: u64,
    pub mean_response_time_ms: f64,
}

#[derive(Default)]
struct StatsState {
    stats: ForwardStats,
    latencies: VecDeque<f64>,
}

pub struct RequestForwarder {
    client: reqwest::Client,
    config: ForwarderConfig,
    circuits: Option<Arc<CircuitBreakerManager>>,
    stats: Mutex<StatsState>,
}

impl RequestForwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            circuits: None,
            stats: Mutex::new(StatsState::default()),
        }
    }

    /// Report attempt outcomes into `circuits` and fail fast on open ones.
    pub fn with_circuits(mut self, circuits: Arc<CircuitBreakerManager>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Send `request` to `target`, retrying transport failures.
    pub async fn forward(
        &self,
        target: &ForwardTarget,
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, ForwardError> {
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);
        self.stats.lock().stats.total_requests += 1;

        let result = self
            .forward_with_retries(target, request, max_retries, false)
            .await;
        self.record_outcome(&result);
        result
    }

    /// Try `targets` in order: the first with retries, each fallback once.
    ///
    /// Targets whose circuit is open are skipped. If every target fails the
    /// error lists each target's reason.
    pub async fn forward_with_fallback(
        &self,
        targets: &[ForwardTarget],
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, ForwardError> {
        if targets.is_empty() {
            return Err(ForwardError::NoTargets);
        }
        self.stats.lock().stats.total_requests += 1;

        let mut failures = Vec::new();
        for (idx, target) in targets.iter().enumerate() {
            let fallback = idx > 0;
            let max_retries = if fallback {
                0
            } else {
                request.max_retries.unwrap_or(self.config.max_retries)
            };

            match self
                .forward_with_retries(target, request, max_retries, fallback)
                .await
            {
                Ok(response) => {
                    if idx > 0 {
                        info!(node_id = %target.node_id, failed = idx, "Forwarded via fallback node");
                    }
                    let result = Ok(response);
                    self.record_outcome(&result);
                    return result;
                }
                Err(e) => {
                    debug!(node_id = %target.node_id, error = %e, "Forward target failed");
                    failures.push(TargetFailure {
                        node_id: target.node_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        warn!(targets = targets.len(), "All forward targets failed");
        let result = Err(ForwardError::AllTargetsFailed(failures));
        self.record_outcome(&result);
        result
    }

    async fn forward_with_retries(
        &self,
        target: &ForwardTarget,
        request: &ForwardRequest,
        max_retries: u32,
        fallback: bool,
    ) -> Result<ForwardResponse, ForwardError> {
        if let Some(circuits) = &self.circuits {
            circuits.check(&target.node_id)?;
        }
        if fallback {
            self.stats.lock().stats.fallbacks_used += 1;
        }

        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let base_delay = request.retry_delay.unwrap_or(self.config.base_delay);
        let url = join_url(&target.base_url, &request.path);
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts <= max_retries {
            if attempts > 0 {
                if let Some(circuits) = &self.circuits {
                    if !circuits.can_execute(&target.node_id) {
                        last_error = format!("{} (circuit opened)", last_error);
                        break;
                    }
                }
                let delay =
                    backoff_delay(attempts, base_delay, self.config.max_delay, rand::random::<f64>());
                debug!(url = %url, attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Retrying forward");
                self.stats.lock().stats.retries += 1;
                tokio::time::sleep(delay).await;
            }
            attempts += 1;
            self.stats.lock().stats.total_attempts += 1;

            match tokio::time::timeout(timeout, self.send_once(&url, request, &request_id)).await {
                Ok(Ok((status_code, headers, body))) => {
                    if let Some(circuits) = &self.circuits {
                        if status_code >= 500 {
                            circuits.record_failure(&target.node_id);
                        } else {
                            circuits.record_success(&target.node_id);
                        }
                    }
                    return Ok(ForwardResponse {
                        status_code,
                        headers,
                        body,
                        target_url: url,
                        node_id: target.node_id.clone(),
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!("timed out after {}ms", timeout.as_millis());
                }
            }

            debug!(url = %url, attempt = attempts, error = %last_error, "Forward attempt failed");
            if let Some(circuits) = &self.circuits {
                circuits.record_failure(&target.node_id);
            }
        }

        Err(ForwardError::AttemptsExhausted {
            target_url: url,
            attempts,
            last_error,
        })
    }

    async fn send_once(
        &self,
        url: &str,
        request: &ForwardRequest,
        request_id: &str,
    ) -> Result<(u16, BTreeMap<String, String>, String), reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header("x-request-id", request_id)
            .header("x-forwarded-by", self.config.forwarded_by.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.text().await?;
        Ok((status, headers, body))
    }

    fn record_outcome(&self, result: &Result<ForwardResponse, ForwardError>) {
        let mut state = self.stats.lock();
        match result {
            Ok(response) => {
                state.stats.successful_requests += 1;
                state.latencies.push_back(response.duration_ms as f64);
                while state.latencies.len() > self.config.latency_window.max(1) {
                    state.latencies.pop_front();
                }
                let n = state.latencies.len() as f64;
                state.stats.mean_response_time_ms = state.latencies.iter().sum::<f64>() / n;
            }
            Err(_) => state.stats.failed_requests += 1,
        }
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.lock().stats.clone()
    }

    /// Rolling mean over recent successful calls, 0 when none.
    pub fn mean_response_time_ms(&self) -> f64 {
        self.stats.lock().stats.mean_response_time_ms
    }
}

impl std::fmt::Debug for RequestForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestForwarder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::events::EventBus;
    use fleet_events::CircuitState;
    use rstest::rstest;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> ForwarderConfig {
        ForwarderConfig {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    /// A port nothing listens on.
    fn refused_target(node_id: &str) -> ForwardTarget {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        ForwardTarget::new(node_id, format!("http://{}", addr))
    }

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(6, 30_000)]
    fn test_backoff_without_jitter(#[case] attempt: u32, #[case] expected_ms: u64) {
        let delay = backoff_delay(
            attempt,
            Duration::from_secs(1),
            Duration::from_secs(30),
            0.0,
        );
        assert_eq!(delay, Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let delay = backoff_delay(1, Duration::from_secs(1), Duration::from_secs(30), 0.999);
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay < Duration::from_millis(1500));
    }

    #[rstest]
    #[case(429, true)]
    #[case(502, true)]
    #[case(503, true)]
    #[case(504, true)]
    #[case(500, false)]
    #[case(404, false)]
    fn test_retryable_statuses(#[case] status: u16, #[case] retryable: bool) {
        assert_eq!(is_retryable_status(status), retryable);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://n:1/", "/v1/jobs"), "http://n:1/v1/jobs");
        assert_eq!(join_url("http://n:1", "v1/jobs"), "http://n:1/v1/jobs");
        assert_eq!(join_url("http://n:1", ""), "http://n:1");
    }

    #[tokio::test]
    async fn test_forward_success_sets_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/jobs"))
            .and(header_exists("x-request-id"))
            .and(header("x-forwarded-by", "control-plane"))
            .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = RequestForwarder::new(fast_config());
        let target = ForwardTarget::new("node-1", server.uri());
        let response = forwarder
            .forward(&target, &ForwardRequest::post_json("/v1/jobs", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status_code, 202);
        assert_eq!(response.body, "accepted");
        assert_eq!(response.attempts, 1);
        assert_eq!(response.target_url, format!("{}/v1/jobs", server.uri()));

        let stats = forwarder.stats();
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = RequestForwarder::new(fast_config());
        let response = forwarder
            .forward(
                &ForwardTarget::new("node-1", server.uri()),
                &ForwardRequest::get("/status"),
            )
            .await
            .unwrap();
        assert_eq!(response.status_code, 503);
        assert!(is_retryable_status(response.status_code));
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let forwarder = RequestForwarder::new(fast_config());
        let err = forwarder
            .forward(
                &ForwardTarget::new("node-1", server.uri()),
                &ForwardRequest::get("/slow").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        match err {
            ForwardError::AttemptsExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "timed out after 50ms");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let stats = forwarder.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_fallback_after_primary_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let forwarder = RequestForwarder::new(fast_config());
        let targets = vec![
            refused_target("node-dead"),
            ForwardTarget::new("node-ok", server.uri()),
        ];
        let response = forwarder
            .forward_with_fallback(&targets, &ForwardRequest::get("/"))
            .await
            .unwrap();

        assert_eq!(response.node_id, "node-ok");
        assert_eq!(forwarder.stats().fallbacks_used, 1);
    }

    #[tokio::test]
    async fn test_fallback_with_open_circuit_is_not_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let circuits = Arc::new(
            CircuitBreakerManager::new(
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                },
                EventBus::default(),
            )
            .unwrap(),
        );
        circuits.record_failure("node-open");
        assert_eq!(circuits.state("node-open"), CircuitState::Open);

        let forwarder = RequestForwarder::new(fast_config()).with_circuits(circuits);
        let targets = vec![
            refused_target("node-dead"),
            ForwardTarget::new("node-open", server.uri()),
            ForwardTarget::new("node-ok", server.uri()),
        ];
        let response = forwarder
            .forward_with_fallback(&targets, &ForwardRequest::get("/"))
            .await
            .unwrap();

        assert_eq!(response.node_id, "node-ok");
        assert_eq!(forwarder.stats().fallbacks_used, 1);
    }

    #[tokio::test]
    async fn test_all_targets_failed_aggregates_reasons() {
        let forwarder = RequestForwarder::new(fast_config());
        let targets = vec![refused_target("a"), refused_target("b")];

        let err = forwarder
            .forward_with_fallback(&targets, &ForwardRequest::get("/"))
            .await
            .unwrap_err();
        match &err {
            ForwardError::AllTargetsFailed(failures) => {
                let ids: Vec<&str> = failures.iter().map(|f| f.node_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("all targets failed: a: "));

        assert_eq!(
            forwarder
                .forward_with_fallback(&[], &ForwardRequest::get("/"))
                .await
                .unwrap_err(),
            ForwardError::NoTargets
        );
    }

    #[tokio::test]
    async fn test_failures_open_circuit_and_fast_fail() {
        let circuits = Arc::new(
            CircuitBreakerManager::new(
                CircuitBreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
                EventBus::default(),
            )
            .unwrap(),
        );
        let forwarder = RequestForwarder::new(fast_config()).with_circuits(circuits.clone());
        let target = refused_target("node-1");

        let err = forwarder
            .forward(&target, &ForwardRequest::get("/"))
            .await
            .unwrap_err();
        // Second failure opens the circuit, so the third attempt never runs.
        assert!(matches!(err, ForwardError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(circuits.state("node-1"), CircuitState::Open);

        let err = forwarder
            .forward(&target, &ForwardRequest::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_mean_response_time_tracks_successes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let forwarder = RequestForwarder::new(fast_config());
        assert_eq!(forwarder.mean_response_time_ms(), 0.0);
        for _ in 0..3 {
            forwarder
                .forward(
                    &ForwardTarget::new("node-1", server.uri()),
                    &ForwardRequest::get("/"),
                )
                .await
                .unwrap();
        }
        assert!(forwarder.mean_response_time_ms() >= 0.0);
        assert_eq!(forwarder.stats().successful_requests, 3);
    }
}
