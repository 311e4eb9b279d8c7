//! Control plane API client for the node agent.
//!
//! Every body is a [`SignedMessage`] signed with the cluster secret under
//! this node's id. Heartbeats additionally carry the node's bearer token.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fleet_events::{HealthStatus, HeartbeatPayload};
use fleet_signing::{SignedCommunication, SignedMessage, SigningConfig};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::Config;

/// Registration body, signed by the node itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRegistration {
    pub id: String,
    pub address: SocketAddr,
    pub region: String,
    pub weight: f64,
    pub capacity: NodeCapacity,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeCapacity {
    pub max_connections: u32,
    pub max_jobs: u32,
}

impl NodeRegistration {
    pub fn from_config(config: &Config) -> Self {
        Self {
            id: config.node_id.clone(),
            address: config.advertise_addr,
            region: config.region.clone(),
            weight: config.weight,
            capacity: NodeCapacity {
                max_connections: config.max_connections,
                max_jobs: config.max_jobs,
            },
            capabilities: config.capabilities.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredNode {
    pub node_id: String,
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    pub node_id: String,
    pub health: HealthStatus,
    pub status: String,
}

/// Result of posting a heartbeat.
#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    Accepted(HeartbeatAck),
    /// The control plane refused the token; the node has to register again.
    Unauthorized,
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
    signer: SignedCommunication,
    token: Option<String>,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        let signer = SignedCommunication::new(&config.cluster_secret, SigningConfig::default())
            .context("invalid cluster secret")?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.clone(),
            node_id: config.node_id.clone(),
            signer,
            token: config.node_token.clone(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Drop the current token so the next heartbeat re-registers.
    pub fn forget_token(&mut self) {
        self.token = None;
    }

    fn sign<T: Serialize>(&self, payload: &T) -> Result<SignedMessage> {
        let json = serde_json::to_string(payload)?;
        Ok(self.signer.sign(json, self.node_id.clone()))
    }

    /// Register this node and keep the returned heartbeat token.
    pub async fn register(&mut self, registration: &NodeRegistration) -> Result<RegisteredNode> {
        let url = format!("{}/v1/nodes", self.base_url);
        debug!(url = %url, node_id = %registration.id, "Registering node");

        let body = self.sign(registration)?;
        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to register node");
            anyhow::bail!("Failed to register node: {} - {}", status, body);
        }

        let registered: RegisteredNode = response.json().await?;
        info!(
            node_id = %registered.node_id,
            token_id = %registered.token_id,
            expires_at = %registered.expires_at,
            "Node registered"
        );
        self.token = Some(registered.token.clone());

        Ok(registered)
    }

    /// Send a signed heartbeat.
    pub async fn send_heartbeat(&self, payload: &HeartbeatPayload) -> Result<HeartbeatOutcome> {
        let token = self
            .token
            .as_deref()
            .context("no heartbeat token; the node must register first")?;

        let url = format!("{}/v1/nodes/heartbeat", self.base_url);
        let body = self.sign(payload)?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(HeartbeatOutcome::Unauthorized),
            status if status.is_success() => Ok(HeartbeatOutcome::Accepted(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Heartbeat rejected: {} - {}", status, body);
            }
        }
    }
}
