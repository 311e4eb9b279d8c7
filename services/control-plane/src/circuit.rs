//! Per-node circuit breakers.
//!
//! Each node gets a three-state breaker, created lazily on first traffic:
//!
//! - `Closed`: traffic allowed. Failures are counted in a sliding window;
//!   reaching the threshold inside the window opens the circuit.
//! - `Open`: traffic blocked until `retry_after`. The first allowance check
//!   at or after `retry_after` moves the circuit to `HalfOpen`.
//! - `HalfOpen`: traffic allowed. One failure reopens, `success_threshold`
//!   successes close.
//!
//! Every transition clears the window and half-open counters and publishes a
//! [`ClusterEvent::CircuitStateChanged`]. Lifetime totals survive transitions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use fleet_events::{CircuitState, ClusterEvent};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::events::EventBus;

/// Returned when a node's circuit is open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit open for node {node_id} (retry in {}ms)", retry_in.as_millis())]
pub struct CircuitOpenError {
    pub node_id: String,
    pub retry_in: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that open the circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    /// Time an open circuit blocks traffic before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::new("circuit", "failure_threshold must be >= 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::new("circuit", "success_threshold must be >= 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::new("circuit", "window must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CircuitInfo {
    state: CircuitState,
    /// Failure times inside the window (Closed only).
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    total_failures: u64,
    total_successes: u64,
    retry_after: Option<Instant>,
}

impl CircuitInfo {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(
        &mut self,
        to: CircuitState,
        now: Instant,
        recovery: Duration,
    ) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.failures.clear();
        self.half_open_successes = 0;
        self.retry_after = (to == CircuitState::Open).then(|| now + recovery);
        (from, to)
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub node_id: String,
    pub state: CircuitState,
    /// Failures inside the current window.
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Remaining block time when open.
    pub retry_in_ms: Option<u64>,
}

/// Circuit breakers keyed by node id.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitInfo>>,
    events: EventBus,
}

type Transition = (String, CircuitState, CircuitState);

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether `node_id` may receive traffic now.
    pub fn can_execute(&self, node_id: &str) -> bool {
        self.check_at(node_id, Instant::now()).is_ok()
    }

    pub fn check(&self, node_id: &str) -> Result<(), CircuitOpenError> {
        self.check_at(node_id, Instant::now())
    }

    /// Allowance check. An open circuit past `retry_after` moves to
    /// `HalfOpen` here.
    pub fn check_at(&self, node_id: &str, now: Instant) -> Result<(), CircuitOpenError> {
        let (result, transition) = {
            let mut circuits = self.circuits.lock();
            let info = circuits.entry(node_id.to_string()).or_default();

            match info.state {
                CircuitState::Closed | CircuitState::HalfOpen => (Ok(()), None),
                CircuitState::Open => match info.retry_after {
                    Some(retry_after) if now < retry_after => (
                        Err(CircuitOpenError {
                            node_id: node_id.to_string(),
                            retry_in: retry_after - now,
                        }),
                        None,
                    ),
                    _ => {
                        let (from, to) = info.transition(
                            CircuitState::HalfOpen,
                            now,
                            self.config.recovery_timeout,
                        );
                        (Ok(()), Some((node_id.to_string(), from, to)))
                    }
                },
            }
        };

        self.announce(transition);
        result
    }

    pub fn record_success(&self, node_id: &str) {
        self.record_success_at(node_id, Instant::now());
    }

    pub fn record_success_at(&self, node_id: &str, now: Instant) {
        let transition = {
            let mut circuits = self.circuits.lock();
            let info = circuits.entry(node_id.to_string()).or_default();
            info.total_successes += 1;

            match info.state {
                CircuitState::Closed => {
                    info.prune(now, self.config.window);
                    None
                }
                CircuitState::HalfOpen => {
                    info.half_open_successes += 1;
                    if info.half_open_successes >= self.config.success_threshold {
                        let (from, to) = info.transition(
                            CircuitState::Closed,
                            now,
                            self.config.recovery_timeout,
                        );
                        Some((node_id.to_string(), from, to))
                    } else {
                        None
                    }
                }
                // A call admitted before the circuit opened.
                CircuitState::Open => None,
            }
        };

        self.announce(transition);
    }

    pub fn record_failure(&self, node_id: &str) {
        self.record_failure_at(node_id, Instant::now());
    }

    pub fn record_failure_at(&self, node_id: &str, now: Instant) {
        let transition = {
            let mut circuits = self.circuits.lock();
            let info = circuits.entry(node_id.to_string()).or_default();
            info.total_failures += 1;

            match info.state {
                CircuitState::Closed => {
                    info.failures.push_back(now);
                    info.prune(now, self.config.window);
                    if info.failures.len() >= self.config.failure_threshold as usize {
                        let (from, to) =
                            info.transition(CircuitState::Open, now, self.config.recovery_timeout);
                        Some((node_id.to_string(), from, to))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    let (from, to) =
                        info.transition(CircuitState::Open, now, self.config.recovery_timeout);
                    Some((node_id.to_string(), from, to))
                }
                CircuitState::Open => None,
            }
        };

        self.announce(transition);
    }

    /// Current state without triggering the lazy open-to-half-open move.
    pub fn state(&self, node_id: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(node_id)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    /// Force a circuit closed.
    pub fn reset(&self, node_id: &str) {
        let transition = {
            let mut circuits = self.circuits.lock();
            circuits.get_mut(node_id).and_then(|info| {
                (info.state != CircuitState::Closed).then(|| {
                    let (from, to) = info.transition(
                        CircuitState::Closed,
                        Instant::now(),
                        self.config.recovery_timeout,
                    );
                    (node_id.to_string(), from, to)
                })
            })
        };
        self.announce(transition);
    }

    /// Forget a node's circuit entirely.
    pub fn remove(&self, node_id: &str) -> bool {
        self.circuits.lock().remove(node_id).is_some()
    }

    /// Subset of `node_ids` whose circuits currently allow traffic.
    pub fn allowed(&self, node_ids: &[String]) -> Vec<String> {
        let now = Instant::now();
        node_ids
            .iter()
            .filter(|id| self.check_at(id, now).is_ok())
            .cloned()
            .collect()
    }

    pub fn stats(&self, node_id: &str) -> Option<CircuitStats> {
        self.stats_at(node_id, Instant::now())
    }

    pub fn stats_at(&self, node_id: &str, now: Instant) -> Option<CircuitStats> {
        let circuits = self.circuits.lock();
        circuits
            .get(node_id)
            .map(|info| Self::snapshot(node_id, info, now))
    }

    /// Stats for every known circuit, ordered by node id.
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let now = Instant::now();
        let circuits = self.circuits.lock();
        let mut stats: Vec<CircuitStats> = circuits
            .iter()
            .map(|(id, info)| Self::snapshot(id, info, now))
            .collect();
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }

    fn snapshot(node_id: &str, info: &CircuitInfo, now: Instant) -> CircuitStats {
        CircuitStats {
            node_id: node_id.to_string(),
            state: info.state,
            failure_count: info.failures.len() as u32,
            half_open_successes: info.half_open_successes,
            total_failures: info.total_failures,
            total_successes: info.total_successes,
            retry_in_ms: info
                .retry_after
                .map(|r| r.saturating_duration_since(now).as_millis() as u64),
        }
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((node_id, from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => warn!(node_id = %node_id, from = %from, "Circuit opened"),
            CircuitState::HalfOpen => info!(node_id = %node_id, "Circuit half-open, probing"),
            CircuitState::Closed => info!(node_id = %node_id, from = %from, "Circuit closed"),
        }

        self.events
            .publish(ClusterEvent::CircuitStateChanged { node_id, from, to });
    }
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("circuits", &self.circuits.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain_events;

    fn manager() -> CircuitBreakerManager {
        CircuitBreakerManager::new(CircuitBreakerConfig::default(), EventBus::default()).unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_threshold_failures_open_circuit() {
        let cb = manager();
        let t0 = Instant::now();

        for i in 0..4 {
            cb.record_failure_at("node-1", t0 + ms(i * 100));
            assert_eq!(cb.state("node-1"), CircuitState::Closed);
        }
        cb.record_failure_at("node-1", t0 + ms(500));
        assert_eq!(cb.state("node-1"), CircuitState::Open);

        let err = cb.check_at("node-1", t0 + ms(600)).unwrap_err();
        assert_eq!(err.retry_in, ms(30_000 - 100));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let cb = manager();
        let t0 = Instant::now();

        for i in 0..4 {
            cb.record_failure_at("node-1", t0 + ms(i));
        }
        // Four old failures slide out before the fifth.
        cb.record_failure_at("node-1", t0 + Duration::from_secs(61));
        assert_eq!(cb.state("node-1"), CircuitState::Closed);
        assert_eq!(cb.stats_at("node-1", t0).unwrap().failure_count, 1);
    }

    #[test]
    fn test_open_moves_to_half_open_lazily() {
        let cb = manager();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("node-1", t0);
        }

        let recovery = t0 + Duration::from_secs(30);
        assert!(cb.check_at("node-1", recovery - ms(1)).is_err());
        // No timer: still open until somebody asks.
        assert_eq!(cb.state("node-1"), CircuitState::Open);

        assert!(cb.check_at("node-1", recovery).is_ok());
        assert_eq!(cb.state("node-1"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = manager();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("node-1", t0);
        }
        let probe = t0 + Duration::from_secs(31);
        cb.check_at("node-1", probe).unwrap();

        cb.record_success_at("node-1", probe);
        cb.record_failure_at("node-1", probe + ms(10));
        assert_eq!(cb.state("node-1"), CircuitState::Open);
        assert!(cb.check_at("node-1", probe + ms(20)).is_err());
    }

    #[test]
    fn test_half_open_successes_close() {
        let cb = manager();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("node-1", t0);
        }
        let probe = t0 + Duration::from_secs(30);
        cb.check_at("node-1", probe).unwrap();

        cb.record_success_at("node-1", probe);
        assert_eq!(cb.state("node-1"), CircuitState::HalfOpen);
        cb.record_success_at("node-1", probe);
        assert_eq!(cb.state("node-1"), CircuitState::Closed);

        let stats = cb.stats_at("node-1", probe).unwrap();
        assert_eq!(stats.total_failures, 5);
        assert_eq!(stats.total_successes, 2);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.retry_in_ms, None);
    }

    #[test]
    fn test_transitions_publish_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let cb = CircuitBreakerManager::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                ..Default::default()
            },
            bus,
        )
        .unwrap();

        let t0 = Instant::now();
        cb.record_failure_at("node-1", t0);
        cb.check_at("node-1", t0 + Duration::from_secs(30)).unwrap();
        cb.record_success_at("node-1", t0 + Duration::from_secs(30));

        let transitions: Vec<(CircuitState, CircuitState)> = drain_events(&mut rx)
            .into_iter()
            .map(|e| match e {
                ClusterEvent::CircuitStateChanged { from, to, .. } => (from, to),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_circuits_are_independent() {
        let cb = manager();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("node-1", t0);
        }
        assert!(cb.check_at("node-2", t0).is_ok());

        let allowed = cb.allowed(&["node-1".to_string(), "node-2".to_string()]);
        assert_eq!(allowed, vec!["node-2".to_string()]);
    }

    #[test]
    fn test_reset_and_remove() {
        let cb = manager();
        for _ in 0..5 {
            cb.record_failure("node-1");
        }
        cb.reset("node-1");
        assert_eq!(cb.state("node-1"), CircuitState::Closed);
        assert!(cb.can_execute("node-1"));
        assert_eq!(cb.stats("node-1").unwrap().total_failures, 5);

        assert!(cb.remove("node-1"));
        assert!(cb.stats("node-1").is_none());
        assert!(cb.all_stats().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(CircuitBreakerManager::new(config, EventBus::default()).is_err());
    }
}
