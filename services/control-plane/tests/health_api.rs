use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleet_control_plane::{
    api, config::Config, scheduler::HttpJobExecutor, state::AppState,
    forwarder::{ForwarderConfig, RequestForwarder},
};
use fleet_signing::{SignedCommunication, SigningConfig};
use tower::ServiceExt;

fn router() -> axum::Router {
    let config = Config::from_lookup(|key| (key == "FLEET_DEV").then(|| "1".to_string())).unwrap();
    let signer = Arc::new(SignedCommunication::new("secret", SigningConfig::default()).unwrap());
    let executor = HttpJobExecutor::new(
        RequestForwarder::new(ForwarderConfig::default()),
        signer,
        "control-plane",
    );
    let state = AppState::with_executor(&config, Arc::new(executor)).unwrap();
    api::create_router(state)
}

#[tokio::test]
async fn test_probes_respond() {
    for path in ["/healthz", "/livez", "/readyz"] {
        let response = router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn test_readyz_reports_empty_cluster() {
    let response = router()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cluster"]["total"], 0);
    assert_eq!(body["cluster"]["status"], "unknown");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let response = router()
        .oneshot(Request::builder().uri("/v2/nothing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
