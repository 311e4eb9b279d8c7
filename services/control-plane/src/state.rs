//! Application state shared across request handlers and workers.

use std::sync::Arc;

use fleet_signing::{SignedCommunication, SigningConfig};

use crate::autoscaler::AutoScaler;
use crate::balancer::LoadBalancer;
use crate::circuit::CircuitBreakerManager;
use crate::config::{Config, ConfigError};
use crate::drain::DrainManager;
use crate::events::EventBus;
use crate::forwarder::RequestForwarder;
use crate::policy::NetworkPolicyManager;
use crate::priority::PriorityManager;
use crate::registry::NodeRegistry;
use crate::scheduler::{HttpJobExecutor, JobExecutor, Scheduler, SchedulerParts};
use crate::tokens::TokenAuthManager;

/// Sender id the control plane signs with.
pub const CONTROL_PLANE_SENDER_ID: &str = "control-plane";

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    events: EventBus,
    scheduler: Arc<Scheduler>,
    tokens: Arc<TokenAuthManager>,
    signer: Arc<SignedCommunication>,
    autoscaler: Arc<AutoScaler>,
}

impl AppState {
    /// Build every component from `config`, dispatching over HTTP.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let signer = Arc::new(signer(config)?);
        let executor = HttpJobExecutor::new(
            RequestForwarder::new(config.forwarder.clone()),
            signer.clone(),
            CONTROL_PLANE_SENDER_ID,
        );
        Self::build(config, signer, Arc::new(executor))
    }

    /// Build every component from `config` with a custom executor.
    pub fn with_executor(config: &Config, executor: Arc<dyn JobExecutor>) -> Result<Self, ConfigError> {
        Self::build(config, Arc::new(signer(config)?), executor)
    }

    fn build(
        config: &Config,
        signer: Arc<SignedCommunication>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self, ConfigError> {
        let events = EventBus::default();

        let circuits = Arc::new(CircuitBreakerManager::new(config.circuit.clone(), events.clone())?);
        let forwarder =
            Arc::new(RequestForwarder::new(config.forwarder.clone()).with_circuits(circuits.clone()));

        let parts = SchedulerParts {
            registry: Arc::new(NodeRegistry::new(events.clone())),
            priority: Arc::new(PriorityManager::new(config.priority.clone(), events.clone())?),
            balancer: Arc::new(LoadBalancer::from_kind(config.strategy)),
            circuits,
            policy: Arc::new(NetworkPolicyManager::new(config.network_policy.clone())),
            drains: DrainManager::new(config.drain_timeout, events.clone()),
            forwarder,
        };

        let tokens = Arc::new(TokenAuthManager::new(&config.cluster_secret, config.token_ttl)?);
        let autoscaler = Arc::new(AutoScaler::new(config.autoscaler.clone(), events.clone())?);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                events,
                scheduler: Arc::new(Scheduler::new(parts, executor)),
                tokens,
                signer,
                autoscaler,
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.scheduler.parts().registry
    }

    pub fn priority(&self) -> &Arc<PriorityManager> {
        &self.inner.scheduler.parts().priority
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerManager> {
        &self.inner.scheduler.parts().circuits
    }

    pub fn policy(&self) -> &Arc<NetworkPolicyManager> {
        &self.inner.scheduler.parts().policy
    }

    pub fn drains(&self) -> &DrainManager {
        &self.inner.scheduler.parts().drains
    }

    pub fn forwarder(&self) -> &Arc<RequestForwarder> {
        &self.inner.scheduler.parts().forwarder
    }

    pub fn tokens(&self) -> &Arc<TokenAuthManager> {
        &self.inner.tokens
    }

    pub fn signer(&self) -> &Arc<SignedCommunication> {
        &self.inner.signer
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.inner.autoscaler
    }
}

fn signer(config: &Config) -> Result<SignedCommunication, ConfigError> {
    SignedCommunication::new(&config.cluster_secret, SigningConfig::default())
        .map_err(|e| ConfigError::new("signing", e.to_string()))
}
