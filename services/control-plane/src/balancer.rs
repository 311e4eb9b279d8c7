//! Node selection.
//!
//! Strategies implement [`SelectionStrategy`] and only ever see nodes that
//! are healthy and below capacity. [`LoadBalancer`] does that filtering,
//! applies capability requirements and delegates to the configured strategy.

use std::collections::HashMap;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::registry::Node;

/// Per-call selection inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionContext {
    pub session_id: Option<String>,
    pub required_capabilities: Vec<String>,
}

impl SelectionContext {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn capabilities<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// A node selection policy.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose among `nodes`, all of which are eligible.
    fn select(&self, nodes: &[Node], ctx: &SelectionContext) -> Option<Node>;

    /// Called with the full node list whenever it may have changed.
    fn update_nodes(&self, _nodes: &[Node]) {}
}

// =============================================================================
// Round-robin
// =============================================================================

#[derive(Default)]
struct RoundRobinState {
    /// (id, slots) the queue was built from.
    built_from: Vec<(String, usize)>,
    queue: Vec<String>,
    cursor: usize,
}

/// Cycles through a precomputed queue. In weighted mode each node appears
/// `round(weight)` times, at least once; otherwise once.
pub struct RoundRobin {
    weighted: bool,
    state: Mutex<RoundRobinState>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            weighted: false,
            state: Mutex::new(RoundRobinState::default()),
        }
    }

    pub fn weighted() -> Self {
        Self {
            weighted: true,
            state: Mutex::new(RoundRobinState::default()),
        }
    }

    fn slots(&self, node: &Node) -> usize {
        if self.weighted {
            (node.weight.round().max(0.0) as usize).max(1)
        } else {
            1
        }
    }

    fn rebuild(&self, state: &mut RoundRobinState, nodes: &[Node]) {
        let mut built_from: Vec<(String, usize)> =
            nodes.iter().map(|n| (n.id.clone(), self.slots(n))).collect();
        built_from.sort();
        if built_from == state.built_from && !state.queue.is_empty() {
            return;
        }

        state.queue = built_from
            .iter()
            .flat_map(|(id, slots)| std::iter::repeat(id.clone()).take(*slots))
            .collect();
        state.built_from = built_from;
        state.cursor = 0;
    }

    fn next_present(state: &mut RoundRobinState, nodes: &[Node]) -> Option<Node> {
        let len = state.queue.len();
        for step in 0..len {
            let idx = (state.cursor + step) % len;
            if let Some(node) = nodes.iter().find(|n| n.id == state.queue[idx]) {
                state.cursor = (idx + 1) % len;
                return Some(node.clone());
            }
        }
        None
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        if self.weighted {
            "weighted-round-robin"
        } else {
            "round-robin"
        }
    }

    fn select(&self, nodes: &[Node], _ctx: &SelectionContext) -> Option<Node> {
        let mut state = self.state.lock();
        if let Some(node) = Self::next_present(&mut state, nodes) {
            return Some(node);
        }
        // Nothing in the queue is eligible; the node list may have moved on
        // without an update.
        self.rebuild(&mut state, nodes);
        Self::next_present(&mut state, nodes)
    }

    fn update_nodes(&self, nodes: &[Node]) {
        let mut state = self.state.lock();
        self.rebuild(&mut state, nodes);
    }
}

// =============================================================================
// Least connections
// =============================================================================

/// Lowest `active_connections / max_connections` wins.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    fn pick(nodes: &[Node]) -> Option<Node> {
        nodes
            .iter()
            .min_by(|a, b| {
                a.connection_ratio()
                    .total_cmp(&b.connection_ratio())
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }
}

impl SelectionStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn select(&self, nodes: &[Node], _ctx: &SelectionContext) -> Option<Node> {
        Self::pick(nodes)
    }
}

// =============================================================================
// Session affinity
// =============================================================================

/// Pins a session to a node chosen by hashing the session id.
///
/// A pinned node that is no longer eligible is replaced by the
/// least-connections choice and the session remapped.
#[derive(Default)]
pub struct SessionAffinity {
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_index(session_id: &str, len: usize) -> usize {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % len as u64) as usize
    }

    pub fn mapped_node(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl SelectionStrategy for SessionAffinity {
    fn name(&self) -> &'static str {
        "session-affinity"
    }

    fn select(&self, nodes: &[Node], ctx: &SelectionContext) -> Option<Node> {
        let Some(session_id) = ctx.session_id.as_deref() else {
            return LeastConnections::pick(nodes);
        };
        if nodes.is_empty() {
            return None;
        }

        let mut sessions = self.sessions.lock();
        let chosen = match sessions.get(session_id) {
            Some(pinned) => match nodes.iter().find(|n| &n.id == pinned) {
                Some(node) => return Some(node.clone()),
                None => {
                    debug!(session_id, node_id = %pinned, "Pinned node unavailable, remapping");
                    LeastConnections::pick(nodes)?
                }
            },
            None => {
                let mut ordered: Vec<&Node> = nodes.iter().collect();
                ordered.sort_by(|a, b| a.id.cmp(&b.id));
                ordered[Self::hash_index(session_id, ordered.len())].clone()
            }
        };

        sessions.insert(session_id.to_string(), chosen.id.clone());
        Some(chosen)
    }

    fn update_nodes(&self, nodes: &[Node]) {
        self.sessions
            .lock()
            .retain(|_, node_id| nodes.iter().any(|n| &n.id == node_id));
    }
}

// =============================================================================
// Health weighted
// =============================================================================

/// Default blend between live health and static weight.
pub const DEFAULT_HEALTH_FACTOR: f64 = 0.7;

/// Lowest composite score wins:
/// `(cpu*0.4 + mem*0.3 + conn*0.3) * hf + (1 - weight/10) * (1 - hf)`.
#[derive(Debug)]
pub struct HealthWeighted {
    health_factor: f64,
}

impl HealthWeighted {
    pub fn new(health_factor: f64) -> Self {
        Self {
            health_factor: health_factor.clamp(0.0, 1.0),
        }
    }

    pub fn score(&self, node: &Node) -> f64 {
        let cpu = node.load.cpu_usage / 100.0;
        let mem = node.load.memory_usage / 100.0;
        let live = cpu * 0.4 + mem * 0.3 + node.connection_ratio() * 0.3;
        let static_part = 1.0 - node.weight / 10.0;
        live * self.health_factor + static_part * (1.0 - self.health_factor)
    }
}

impl Default for HealthWeighted {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_FACTOR)
    }
}

impl SelectionStrategy for HealthWeighted {
    fn name(&self) -> &'static str {
        "health-weighted"
    }

    fn select(&self, nodes: &[Node], _ctx: &SelectionContext) -> Option<Node> {
        nodes
            .iter()
            .min_by(|a, b| {
                self.score(a)
                    .total_cmp(&self.score(b))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }
}

// =============================================================================
// Strategy selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RoundRobin,
    WeightedRoundRobin,
    #[default]
    LeastConnections,
    SessionAffinity,
    HealthWeighted,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
            StrategyKind::WeightedRoundRobin => Box::new(RoundRobin::weighted()),
            StrategyKind::LeastConnections => Box::new(LeastConnections),
            StrategyKind::SessionAffinity => Box::new(SessionAffinity::new()),
            StrategyKind::HealthWeighted => Box::new(HealthWeighted::default()),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(StrategyKind::RoundRobin),
            "weighted-round-robin" | "weighted" => Ok(StrategyKind::WeightedRoundRobin),
            "least-connections" => Ok(StrategyKind::LeastConnections),
            "session-affinity" => Ok(StrategyKind::SessionAffinity),
            "health-weighted" => Ok(StrategyKind::HealthWeighted),
            other => Err(format!("unknown balancing strategy: {other}")),
        }
    }
}

// =============================================================================
// Load balancer
// =============================================================================

/// Eligibility filtering plus a pluggable strategy.
pub struct LoadBalancer {
    strategy: Box<dyn SelectionStrategy>,
}

impl LoadBalancer {
    pub fn new(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_kind(kind: StrategyKind) -> Self {
        Self::new(kind.build())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn update_nodes(&self, nodes: &[Node]) {
        self.strategy.update_nodes(nodes);
    }

    fn eligible(nodes: &[Node]) -> Vec<Node> {
        nodes.iter().filter(|n| n.is_eligible()).cloned().collect()
    }

    /// Choose one node for the request.
    pub fn select(&self, nodes: &[Node], ctx: &SelectionContext) -> Option<Node> {
        let eligible = Self::eligible(nodes);
        if eligible.is_empty() {
            return None;
        }
        if ctx.required_capabilities.is_empty() {
            self.strategy.select(&eligible, ctx)
        } else {
            select_with_capabilities(&eligible, &ctx.required_capabilities)
        }
    }

    /// Primary choice followed by up to `fallbacks` alternates, least
    /// loaded first.
    pub fn rank(&self, nodes: &[Node], ctx: &SelectionContext, fallbacks: usize) -> Vec<Node> {
        let Some(primary) = self.select(nodes, ctx) else {
            return Vec::new();
        };

        let mut rest: Vec<Node> = Self::eligible(nodes)
            .into_iter()
            .filter(|n| n.id != primary.id && n.has_capabilities(&ctx.required_capabilities))
            .collect();
        rest.sort_by(|a, b| {
            a.connection_ratio()
                .total_cmp(&b.connection_ratio())
                .then_with(|| a.load.cpu_usage.total_cmp(&b.load.cpu_usage))
                .then_with(|| a.id.cmp(&b.id))
        });
        rest.truncate(fallbacks);

        let mut ranked = Vec::with_capacity(rest.len() + 1);
        ranked.push(primary);
        ranked.extend(rest);
        ranked
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Among nodes holding every required capability, prefer the most matches,
/// then the lowest CPU.
pub fn select_with_capabilities(nodes: &[Node], required: &[String]) -> Option<Node> {
    nodes
        .iter()
        .filter(|n| n.has_capabilities(required))
        .max_by(|a, b| {
            let matched = |n: &Node| required.iter().filter(|c| n.capabilities.contains(*c)).count();
            matched(a)
                .cmp(&matched(b))
                .then_with(|| b.load.cpu_usage.total_cmp(&a.load.cpu_usage))
                .then_with(|| b.id.cmp(&a.id))
        })
        .cloned()
}
