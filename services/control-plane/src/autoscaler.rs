//! Fleet autoscaling.
//!
//! Keeps the last `evaluation_periods` samples. Scale-up triggers when the
//! window *average* breaches any scale-up threshold; scale-down only when
//! *every* sample sits at or under the scale-down thresholds. Each direction
//! has its own cooldown and the result is clamped to `[min_nodes, max_nodes]`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use fleet_events::{ClusterEvent, ScalingAction, ScalingDecision, ScalingMetrics};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Samples in the rolling window.
    pub evaluation_periods: usize,

    pub scale_up_queue_depth: f64,
    pub scale_up_cpu_percent: f64,
    pub scale_up_response_time_ms: f64,

    pub scale_down_queue_depth: f64,
    pub scale_down_cpu_percent: f64,

    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub scale_up_step: u32,
    pub scale_down_step: u32,

    /// Decisions kept in history.
    pub history_size: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 10,
            evaluation_periods: 3,
            scale_up_queue_depth: 10.0,
            scale_up_cpu_percent: 80.0,
            scale_up_response_time_ms: 5000.0,
            scale_down_queue_depth: 2.0,
            scale_down_cpu_percent: 30.0,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            scale_up_step: 1,
            scale_down_step: 1,
            history_size: 100,
        }
    }
}

impl AutoscalerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_nodes > self.max_nodes {
            return Err(ConfigError::new(
                "autoscaler",
                format!(
                    "min_nodes ({}) exceeds max_nodes ({})",
                    self.min_nodes, self.max_nodes
                ),
            ));
        }
        if self.evaluation_periods == 0 {
            return Err(ConfigError::new(
                "autoscaler",
                "evaluation_periods must be >= 1",
            ));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(ConfigError::new("autoscaler", "scaling steps must be >= 1"));
        }
        Ok(())
    }
}

struct AutoscalerState {
    samples: VecDeque<ScalingMetrics>,
    history: VecDeque<ScalingDecision>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

pub struct AutoScaler {
    config: AutoscalerConfig,
    state: Mutex<AutoscalerState>,
    events: EventBus,
}

impl AutoScaler {
    pub fn new(config: AutoscalerConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(AutoscalerState {
                samples: VecDeque::with_capacity(config.evaluation_periods),
                history: VecDeque::new(),
                last_scale_up: None,
                last_scale_down: None,
            }),
            config,
            events,
        })
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    pub fn evaluate(&self, sample: ScalingMetrics) -> ScalingDecision {
        self.evaluate_at(sample, Instant::now())
    }

    /// Add a sample and decide.
    pub fn evaluate_at(&self, sample: ScalingMetrics, now: Instant) -> ScalingDecision {
        let decision = {
            let mut state = self.state.lock();
            state.samples.push_back(sample);
            while state.samples.len() > self.config.evaluation_periods {
                state.samples.pop_front();
            }

            let decision = self.decide(&mut state, sample.current_nodes, now);

            state.history.push_back(decision.clone());
            while state.history.len() > self.config.history_size {
                state.history.pop_front();
            }
            decision
        };

        if decision.is_none() {
            debug!(reason = %decision.reason, "No scaling action");
        } else {
            info!(
                action = ?decision.action,
                current_nodes = decision.current_nodes,
                desired_nodes = decision.desired_nodes,
                reason = %decision.reason,
                "Scaling decision"
            );
            self.events
                .publish(ClusterEvent::ScalingDecided(decision.clone()));
        }
        decision
    }

    fn decide(&self, state: &mut AutoscalerState, current: u32, now: Instant) -> ScalingDecision {
        let cfg = &self.config;
        let window = state.samples.len();
        let averages = average(&state.samples, current);

        let decision = |action, desired, reason: String| ScalingDecision {
            action,
            reason,
            current_nodes: current,
            desired_nodes: desired,
            metrics: averages,
            timestamp: Utc::now(),
        };

        if window < cfg.evaluation_periods {
            return decision(
                ScalingAction::None,
                current,
                format!(
                    "insufficient samples ({}/{})",
                    window, cfg.evaluation_periods
                ),
            );
        }

        let mut breaches = Vec::new();
        if averages.queue_depth > cfg.scale_up_queue_depth {
            breaches.push(format!(
                "queue depth {:.1} > {}",
                averages.queue_depth, cfg.scale_up_queue_depth
            ));
        }
        if averages.cpu_percent > cfg.scale_up_cpu_percent {
            breaches.push(format!(
                "cpu {:.1}% > {}%",
                averages.cpu_percent, cfg.scale_up_cpu_percent
            ));
        }
        if averages.response_time_ms > cfg.scale_up_response_time_ms {
            breaches.push(format!(
                "response time {:.0}ms > {}ms",
                averages.response_time_ms, cfg.scale_up_response_time_ms
            ));
        }

        if !breaches.is_empty() {
            if current >= cfg.max_nodes {
                return decision(
                    ScalingAction::None,
                    current,
                    format!("at max nodes ({}) despite {}", cfg.max_nodes, breaches.join(", ")),
                );
            }
            if let Some(remaining) = cooldown_remaining(state.last_scale_up, cfg.scale_up_cooldown, now)
            {
                return decision(
                    ScalingAction::None,
                    current,
                    format!("scale-up cooldown ({}s remaining)", remaining.as_secs()),
                );
            }
            state.last_scale_up = Some(now);
            let desired = current.saturating_add(cfg.scale_up_step).min(cfg.max_nodes);
            return decision(ScalingAction::ScaleUp, desired, breaches.join(", "));
        }

        let all_quiet = state.samples.iter().all(|s| {
            s.queue_depth <= cfg.scale_down_queue_depth && s.cpu_percent <= cfg.scale_down_cpu_percent
        });
        if all_quiet {
            if current <= cfg.min_nodes {
                return decision(
                    ScalingAction::None,
                    current,
                    format!("at min nodes ({})", cfg.min_nodes),
                );
            }
            if let Some(remaining) =
                cooldown_remaining(state.last_scale_down, cfg.scale_down_cooldown, now)
            {
                return decision(
                    ScalingAction::None,
                    current,
                    format!("scale-down cooldown ({}s remaining)", remaining.as_secs()),
                );
            }
            state.last_scale_down = Some(now);
            let desired = current.saturating_sub(cfg.scale_down_step).max(cfg.min_nodes);
            return decision(
                ScalingAction::ScaleDown,
                desired,
                format!(
                    "all {} samples under queue {} and cpu {}%",
                    window, cfg.scale_down_queue_depth, cfg.scale_down_cpu_percent
                ),
            );
        }

        decision(
            ScalingAction::None,
            current,
            "metrics within thresholds".to_string(),
        )
    }

    /// Recorded decisions, oldest first.
    pub fn history(&self) -> Vec<ScalingDecision> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn last_decision(&self) -> Option<ScalingDecision> {
        self.state.lock().history.back().cloned()
    }

    pub fn reset_cooldowns(&self) {
        let mut state = self.state.lock();
        state.last_scale_up = None;
        state.last_scale_down = None;
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().samples.len()
    }
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("config", &self.config)
            .field("samples", &self.sample_count())
            .finish()
    }
}

fn average(samples: &VecDeque<ScalingMetrics>, current: u32) -> ScalingMetrics {
    let n = samples.len().max(1) as f64;
    let (q, c, r) = samples.iter().fold((0.0, 0.0, 0.0), |(q, c, r), s| {
        (q + s.queue_depth, c + s.cpu_percent, r + s.response_time_ms)
    });
    ScalingMetrics {
        queue_depth: q / n,
        cpu_percent: c / n,
        response_time_ms: r / n,
        current_nodes: current,
    }
}

fn cooldown_remaining(last: Option<Instant>, cooldown: Duration, now: Instant) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(last?);
    (elapsed < cooldown).then(|| cooldown - elapsed)
}
