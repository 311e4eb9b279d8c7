//! Handing jobs to nodes.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_signing::SignedCommunication;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::forwarder::{ForwardError, ForwardRequest, ForwardTarget, RequestForwarder};
use crate::priority::PriorityJobEntry;
use crate::registry::Node;

/// Path on the node that accepts job assignments.
pub const JOB_ASSIGNMENT_PATH: &str = "/v1/jobs";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("node unreachable: {0}")]
    Unreachable(#[from] ForwardError),

    #[error("node rejected job with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode assignment: {0}")]
    Encode(String),
}

/// Starts a job on a node. The scheduler owns retry and circuit accounting.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &PriorityJobEntry, node: &Node) -> Result<(), ExecutorError>;
}

/// Assignment body sent to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAssignment {
    pub job_id: String,
    pub user_id: String,
    pub priority: u32,
    pub capabilities: Vec<String>,
}

impl From<&PriorityJobEntry> for JobAssignment {
    fn from(job: &PriorityJobEntry) -> Self {
        Self {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            priority: job.current_level,
            capabilities: job.capabilities.clone(),
        }
    }
}

/// Posts signed assignments to the node's job endpoint.
///
/// The forwarder given here should not report into the scheduler's circuit
/// breakers, since the scheduler records the dispatch outcome itself.
pub struct HttpJobExecutor {
    forwarder: RequestForwarder,
    signer: Arc<SignedCommunication>,
    sender_id: String,
}

impl HttpJobExecutor {
    pub fn new(
        forwarder: RequestForwarder,
        signer: Arc<SignedCommunication>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            forwarder,
            signer,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl JobExecutor for HttpJobExecutor {
    async fn execute(&self, job: &PriorityJobEntry, node: &Node) -> Result<(), ExecutorError> {
        let payload = serde_json::to_string(&JobAssignment::from(job))
            .map_err(|e| ExecutorError::Encode(e.to_string()))?;
        let envelope = self
            .signer
            .sign(payload, self.sender_id.clone())
            .to_json()
            .map_err(|e| ExecutorError::Encode(e.to_string()))?;

        let target = ForwardTarget::new(node.id.clone(), node.base_url());
        let response = self
            .forwarder
            .forward(&target, &ForwardRequest::post_json(JOB_ASSIGNMENT_PATH, envelope))
            .await?;

        if !response.is_success() {
            return Err(ExecutorError::Rejected {
                status: response.status_code,
                body: response.body,
            });
        }
        debug!(job_id = %job.job_id, node_id = %node.id, attempts = response.attempts, "Assignment accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::forwarder::ForwarderConfig;
    use crate::priority::{JobSubmission, PriorityConfig, PriorityManager};
    use crate::registry::{NodeRegistration, NodeRegistry};
    use fleet_signing::{SignedMessage, SigningConfig};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "cluster-secret";

    fn job() -> PriorityJobEntry {
        let priority = PriorityManager::new(PriorityConfig::default(), EventBus::default()).unwrap();
        priority
            .add_job(JobSubmission::new("job-1", "alice", 1).with_capabilities(["docker"]))
            .unwrap()
    }

    fn node_at(server: &MockServer) -> Node {
        let registry = NodeRegistry::new(EventBus::default());
        registry
            .register(NodeRegistration::new("node-1", *server.address()))
            .unwrap()
    }

    fn executor() -> HttpJobExecutor {
        let forwarder = RequestForwarder::new(ForwarderConfig {
            timeout: Duration::from_millis(500),
            max_retries: 0,
            ..Default::default()
        });
        let signer = SignedCommunication::new(SECRET, SigningConfig::default()).unwrap();
        HttpJobExecutor::new(forwarder, Arc::new(signer), "control-plane")
    }

    #[tokio::test]
    async fn test_posts_signed_assignment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(JOB_ASSIGNMENT_PATH))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        executor().execute(&job(), &node_at(&server)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        let message = SignedMessage::from_json(&body).unwrap();
        assert_eq!(message.sender_id, "control-plane");

        let verifier = SignedCommunication::new(SECRET, SigningConfig::default()).unwrap();
        let payload = verifier.verify(&message).unwrap();
        let assignment: JobAssignment = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            assignment,
            JobAssignment {
                job_id: "job-1".into(),
                user_id: "alice".into(),
                priority: 1,
                capabilities: vec!["docker".into()],
            }
        );
    }

    #[tokio::test]
    async fn test_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate"))
            .mount(&server)
            .await;

        let err = executor()
            .execute(&job(), &node_at(&server))
            .await
            .unwrap_err();
        match err {
            ExecutorError::Rejected { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "duplicate");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
