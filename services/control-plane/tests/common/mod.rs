#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_control_plane::{
    api, config::Config,
    priority::PriorityJobEntry,
    registry::Node,
    scheduler::{ExecutorError, JobExecutor},
    state::AppState,
};
use fleet_events::{HealthStatus, HeartbeatPayload};
use fleet_signing::{SignedCommunication, SigningConfig};
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Records assignments instead of calling nodes.
#[derive(Default)]
pub struct RecordingExecutor {
    pub assigned: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &PriorityJobEntry, node: &Node) -> Result<(), ExecutorError> {
        self.assigned
            .lock()
            .push((job.job_id.clone(), node.id.clone()));
        Ok(())
    }
}

pub struct ApiHarness {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: AppState,
    pub executor: Arc<RecordingExecutor>,
    /// Signs as any node, since nodes share the cluster secret.
    pub signer: SignedCommunication,
}

impl ApiHarness {
    pub async fn start() -> Self {
        Self::start_with(&[]).await
    }

    pub async fn start_with(vars: &[(&str, &str)]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,fleet_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let vars: Vec<(String, String)> = [("FLEET_DEV", "1")]
            .iter()
            .chain(vars.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|key| {
            vars.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();

        let executor = Arc::new(RecordingExecutor::default());
        let state = AppState::with_executor(&config, executor.clone()).unwrap();
        let app = api::create_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            state,
            executor,
            signer: SignedCommunication::new(&config.cluster_secret, SigningConfig::default()).unwrap(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register `node_id` and return its heartbeat token.
    pub async fn register(&self, node_id: &str, port: u16) -> String {
        let registration = serde_json::json!({
            "id": node_id,
            "address": format!("127.0.0.1:{port}"),
            "capabilities": ["docker"],
        });
        let message = self.signer.sign(registration.to_string(), node_id);

        let resp = self
            .client
            .post(self.url("/v1/nodes"))
            .json(&message)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201, "registration failed");
        let body: serde_json::Value = resp.json().await.unwrap();
        body["token"].as_str().expect("missing token").to_string()
    }

    pub fn heartbeat(node_id: &str, cpu: f64, health: Option<HealthStatus>) -> HeartbeatPayload {
        HeartbeatPayload {
            node_id: node_id.to_string(),
            cpu_usage: cpu,
            memory_usage: 30.0,
            active_jobs: 0,
            capabilities: vec!["docker".to_string()],
            timestamp: Utc::now().timestamp_millis(),
            health,
        }
    }

    pub async fn send_heartbeat(
        &self,
        token: Option<&str>,
        sender: &str,
        payload: &HeartbeatPayload,
    ) -> reqwest::Response {
        let message = self.signer.sign(payload.to_json().unwrap(), sender);
        let mut request = self.client.post(self.url("/v1/nodes/heartbeat")).json(&message);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }
}
