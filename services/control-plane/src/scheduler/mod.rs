//! Scheduler facade.
//!
//! Wires admission, node selection, fault isolation and draining into the
//! dispatch path:
//! - Admitting jobs through the priority manager
//! - Filtering nodes down to dispatch candidates
//! - Handing the next job to a node through a [`JobExecutor`]
//! - Routing ad-hoc calls through the forwarder with fallbacks
//! - Starting and ending node drains

mod executor;

pub use executor::{ExecutorError, HttpJobExecutor, JobAssignment, JobExecutor};

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use fleet_events::DrainStatus;

use crate::balancer::{LoadBalancer, SelectionContext};
use crate::circuit::CircuitBreakerManager;
use crate::drain::{DrainEntry, DrainError, DrainManager, DrainRequest};
use crate::forwarder::{ForwardError, ForwardRequest, ForwardResponse, ForwardTarget, RequestForwarder};
use crate::policy::{ConnectionRequest, NetworkPolicyManager};
use crate::priority::{AdmissionError, JobSubmission, PriorityJobEntry, PriorityManager};
use crate::registry::{Node, NodeRegistry, NodeStatus, RegistryError};

/// Alternates tried after the primary when forwarding.
pub const DEFAULT_FORWARD_FALLBACKS: usize = 2;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error("no eligible node for job {0}")]
    NoEligibleNode(String),

    #[error("dispatch of job {job_id} to {node_id} failed: {source}")]
    Dispatch {
        job_id: String,
        node_id: String,
        #[source]
        source: ExecutorError,
    },
}

/// A job handed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatched {
    pub job_id: String,
    pub node_id: String,
    pub level: u32,
}

/// Components the scheduler drives. All are shared with the rest of the
/// control plane.
#[derive(Clone)]
pub struct SchedulerParts {
    pub registry: Arc<NodeRegistry>,
    pub priority: Arc<PriorityManager>,
    pub balancer: Arc<LoadBalancer>,
    pub circuits: Arc<CircuitBreakerManager>,
    pub policy: Arc<NetworkPolicyManager>,
    pub drains: DrainManager,
    pub forwarder: Arc<RequestForwarder>,
}

pub struct Scheduler {
    parts: SchedulerParts,
    executor: Arc<dyn JobExecutor>,
    fallbacks: usize,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            parts,
            executor,
            fallbacks: DEFAULT_FORWARD_FALLBACKS,
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: usize) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn parts(&self) -> &SchedulerParts {
        &self.parts
    }

    /// Admit a job into its priority tier.
    pub fn submit(&self, job: JobSubmission) -> Result<PriorityJobEntry, AdmissionError> {
        let entry = self.parts.priority.add_job(job)?;
        debug!(job_id = %entry.job_id, level = entry.current_level, "Job admitted");
        Ok(entry)
    }

    /// Nodes that may receive work right now.
    ///
    /// Active in the registry, not under drain, circuit not open, and
    /// permitted by network policy. Capacity and health are left to the
    /// balancer.
    pub fn candidates(&self) -> Vec<Node> {
        self.parts
            .registry
            .snapshot()
            .into_iter()
            .filter(|node| node.status == NodeStatus::Active)
            .filter(|node| !self.is_draining(&node.id))
            .filter(|node| self.parts.circuits.can_execute(&node.id))
            .filter(|node| {
                let request = ConnectionRequest::tcp(node.address.ip(), node.address.port())
                    .with_tls(node.tls.clone());
                self.parts.policy.check(&request).allowed
            })
            .collect()
    }

    fn is_draining(&self, node_id: &str) -> bool {
        matches!(
            self.parts.drains.status(node_id),
            Some(DrainStatus::Draining | DrainStatus::ForceDraining | DrainStatus::Drained)
        )
    }

    /// Hand the next queued job to a node.
    ///
    /// Returns `Ok(None)` when nothing is queued or every tier is at its
    /// concurrency limit. A job that cannot be placed or whose dispatch
    /// fails goes back to its queue with its original enqueue time.
    pub async fn dispatch_next(&self) -> Result<Option<Dispatched>, SchedulerError> {
        let Some(job) = self.parts.priority.select_next() else {
            return Ok(None);
        };

        let candidates = self.candidates();
        self.parts.balancer.update_nodes(&candidates);
        let ctx = SelectionContext::capabilities(job.capabilities.iter().cloned());

        let Some(node) = self.parts.balancer.select(&candidates, &ctx) else {
            self.parts.priority.requeue(&job.job_id);
            debug!(job_id = %job.job_id, candidates = candidates.len(), "No eligible node for job");
            return Err(SchedulerError::NoEligibleNode(job.job_id));
        };

        if let Err(e) = self.parts.registry.job_started(&node.id) {
            self.parts.priority.requeue(&job.job_id);
            return Err(e.into());
        }
        self.parts.priority.mark_assigned(&job.job_id, &node.id);

        match self.executor.execute(&job, &node).await {
            Ok(()) => {
                self.parts.circuits.record_success(&node.id);
                info!(job_id = %job.job_id, node_id = %node.id, level = job.current_level, "Job dispatched");
                Ok(Some(Dispatched {
                    job_id: job.job_id,
                    node_id: node.id,
                    level: job.current_level,
                }))
            }
            Err(e) => {
                warn!(job_id = %job.job_id, node_id = %node.id, error = %e, "Job dispatch failed");
                self.parts.circuits.record_failure(&node.id);
                // The node is still registered; a concurrent removal only
                // means there is no load left to release.
                let _ = self.parts.registry.job_finished(&node.id);
                self.parts.priority.requeue(&job.job_id);
                Err(SchedulerError::Dispatch {
                    job_id: job.job_id,
                    node_id: node.id,
                    source: e,
                })
            }
        }
    }

    /// Release a finished job's slots and advance any drain on its node.
    pub fn job_finished(&self, job_id: &str, node_id: &str) -> Option<PriorityJobEntry> {
        let entry = self.parts.priority.complete(job_id);
        if entry.is_none() {
            debug!(job_id = %job_id, "Finished job was not tracked");
        }

        match self.parts.registry.job_finished(node_id) {
            Ok(remaining) => {
                if self.parts.drains.status(node_id) == Some(DrainStatus::Draining) {
                    self.parts.drains.job_completed(node_id, remaining);
                }
            }
            Err(e) => debug!(node_id = %node_id, error = %e, "Job finished on unknown node"),
        }
        entry
    }

    /// Forward a call to the balancer's choice, falling back to the next
    /// best candidates.
    pub async fn forward(
        &self,
        request: &ForwardRequest,
        session_id: Option<&str>,
    ) -> Result<ForwardResponse, ForwardError> {
        let candidates = self.candidates();
        self.parts.balancer.update_nodes(&candidates);
        let ctx = session_id.map(SelectionContext::session).unwrap_or_default();

        let targets: Vec<ForwardTarget> = self
            .parts
            .balancer
            .rank(&candidates, &ctx, self.fallbacks)
            .into_iter()
            .map(|node| ForwardTarget::new(node.id.clone(), node.base_url()))
            .collect();

        self.parts.forwarder.forward_with_fallback(&targets, request).await
    }

    /// Stop new work to a node and wait for its running jobs.
    pub fn start_drain(&self, node_id: &str, request: DrainRequest) -> Result<DrainEntry, SchedulerError> {
        let node = self
            .parts
            .registry
            .get(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        let entry = self
            .parts
            .drains
            .start_drain(node_id, node.load.active_jobs, request)?;
        self.parts.registry.set_status(node_id, NodeStatus::Draining)?;
        Ok(entry)
    }

    /// Abort an unfinished drain and return the node to service.
    pub fn cancel_drain(&self, node_id: &str) -> Result<DrainEntry, SchedulerError> {
        let entry = self.parts.drains.cancel_drain(node_id)?;
        self.parts.registry.set_status(node_id, NodeStatus::Active)?;
        Ok(entry)
    }

    /// Return a drained node to service.
    pub fn re_enable(&self, node_id: &str) -> Result<(), SchedulerError> {
        self.parts.drains.re_enable(node_id)?;
        self.parts.registry.set_status(node_id, NodeStatus::Active)?;
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("fallbacks", &self.fallbacks)
            .finish_non_exhaustive()
    }
}
