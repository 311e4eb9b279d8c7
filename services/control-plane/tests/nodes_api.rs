mod common;

use common::ApiHarness;
use fleet_events::HealthStatus;
use fleet_signing::SignedMessage;

#[tokio::test]
async fn test_register_then_heartbeat() {
    let harness = ApiHarness::start().await;
    let token = harness.register("node-1", 9101).await;

    let resp = harness
        .send_heartbeat(Some(&token), "node-1", &ApiHarness::heartbeat("node-1", 35.0, None))
        .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], true);
    assert_eq!(body["health"], "healthy");
    assert_eq!(body["status"], "active");

    let node = harness.state.registry().get("node-1").unwrap();
    assert_eq!(node.load.cpu_usage, 35.0);
    assert!(node.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_heartbeat_requires_bearer_token() {
    let harness = ApiHarness::start().await;
    harness.register("node-1", 9101).await;

    let resp = harness
        .send_heartbeat(None, "node-1", &ApiHarness::heartbeat("node-1", 10.0, None))
        .await;
    assert_eq!(resp.status(), 401);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "missing_authorization");
}

#[tokio::test]
async fn test_token_bound_to_other_node_is_rejected() {
    let harness = ApiHarness::start().await;
    let token_a = harness.register("node-a", 9101).await;
    harness.register("node-b", 9102).await;

    let resp = harness
        .send_heartbeat(Some(&token_a), "node-b", &ApiHarness::heartbeat("node-b", 10.0, None))
        .await;
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "token_node_mismatch");
}

#[tokio::test]
async fn test_sender_must_match_payload() {
    let harness = ApiHarness::start().await;
    let token = harness.register("node-1", 9101).await;

    let resp = harness
        .send_heartbeat(Some(&token), "node-2", &ApiHarness::heartbeat("node-1", 10.0, None))
        .await;
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "sender_mismatch");
}

#[tokio::test]
async fn test_replayed_and_tampered_heartbeats() {
    let harness = ApiHarness::start().await;
    let token = harness.register("node-1", 9101).await;

    let payload = ApiHarness::heartbeat("node-1", 10.0, None);
    let message = harness.signer.sign(payload.to_json().unwrap(), "node-1");

    let send = |message: SignedMessage| {
        harness
            .client
            .post(harness.url("/v1/nodes/heartbeat"))
            .bearer_auth(&token)
            .json(&message)
            .send()
    };

    assert_eq!(send(message.clone()).await.unwrap().status(), 200);
    let replay = send(message.clone()).await.unwrap();
    assert_eq!(replay.status(), 409);

    let mut tampered = harness.signer.sign(payload.to_json().unwrap(), "node-1");
    tampered.payload = ApiHarness::heartbeat("node-1", 99.0, None).to_json().unwrap();
    let resp = send(tampered).await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_signature");
}

#[tokio::test]
async fn test_allowlist_denies_unknown_peers() {
    let harness = ApiHarness::start_with(&[("FLEET_ALLOWED_IPS", "10.0.0.0/8")]).await;

    let message = harness.signer.sign(
        serde_json::json!({ "id": "node-1", "address": "10.0.0.5:9100" }).to_string(),
        "node-1",
    );
    let resp = harness
        .client
        .post(harness.url("/v1/nodes"))
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "network_policy_denied");
    assert!(harness.state.registry().is_empty());
}

#[tokio::test]
async fn test_readyz_follows_fleet_health() {
    let harness = ApiHarness::start().await;

    let resp = harness.client.get(harness.url("/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let token = harness.register("node-1", 9101).await;
    let resp = harness
        .send_heartbeat(
            Some(&token),
            "node-1",
            &ApiHarness::heartbeat("node-1", 10.0, Some(HealthStatus::Unhealthy)),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let resp = harness.client.get(harness.url("/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cluster"]["unhealthy"], 1);
    assert!(!harness.state.registry().get("node-1").unwrap().healthy);
}
