//! Priority tiers, per-user admission quotas and fair job selection.
//!
//! Tiers are ordered by level, 0 being the most urgent. A periodic
//! escalation sweep promotes jobs that have waited too long so low tiers are
//! never starved. Selection picks from the most urgent tier with free
//! concurrency, preferring the user with the fewest running jobs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::ClusterEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::events::EventBus;

/// Admission failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The user already has the maximum number of active jobs.
    #[error("user {user_id} has {active} active jobs (limit {limit})")]
    QuotaExceeded {
        user_id: String,
        active: u32,
        limit: u32,
    },

    #[error("unknown priority level {0}")]
    UnknownLevel(u32),

    #[error("job {0} already admitted")]
    DuplicateJob(String),
}

/// A priority bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityTier {
    pub level: u32,
    pub name: String,
    /// Waiting longer than this in the tier below promotes a job into this one.
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    pub weight: u32,
    pub max_concurrent: u32,
}

impl PriorityTier {
    pub fn new(level: u32, name: &str, max_wait: Duration, weight: u32, max_concurrent: u32) -> Self {
        Self {
            level,
            name: name.to_string(),
            max_wait,
            weight,
            max_concurrent,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Must cover levels `0..n` without gaps.
    pub tiers: Vec<PriorityTier>,
    pub max_jobs_per_user: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                PriorityTier::new(0, "critical", Duration::from_secs(30), 8, 10),
                PriorityTier::new(1, "high", Duration::from_secs(120), 4, 20),
                PriorityTier::new(2, "normal", Duration::from_secs(300), 2, 50),
                PriorityTier::new(3, "low", Duration::from_secs(900), 1, 100),
            ],
            max_jobs_per_user: 10,
        }
    }
}

impl PriorityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::new("priority", "at least one tier is required"));
        }
        if self.max_jobs_per_user == 0 {
            return Err(ConfigError::new("priority", "max_jobs_per_user must be >= 1"));
        }
        let mut levels: Vec<u32> = self.tiers.iter().map(|t| t.level).collect();
        levels.sort_unstable();
        if levels.iter().enumerate().any(|(i, l)| *l != i as u32) {
            return Err(ConfigError::new(
                "priority",
                "tier levels must be contiguous starting at 0",
            ));
        }
        Ok(())
    }
}

/// A job to admit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub user_id: String,
    pub priority: u32,
    /// Node capabilities the job needs.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl JobSubmission {
    pub fn new(job_id: impl Into<String>, user_id: impl Into<String>, priority: u32) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            priority,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    /// Slot reserved in `level`; `node_id` is set once a node is chosen.
    Running { level: u32, node_id: Option<String> },
}

/// An admitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityJobEntry {
    pub job_id: String,
    pub user_id: String,
    pub original_level: u32,
    /// Only ever decreases.
    pub current_level: u32,
    pub escalation_count: u32,
    pub escalated: bool,
    pub capabilities: Vec<String>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip)]
    pub enqueued_at: Instant,
    #[serde(skip)]
    seq: u64,
}

impl PriorityJobEntry {
    pub fn is_queued(&self) -> bool {
        self.state == JobState::Queued
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityStats {
    pub tiers: BTreeMap<u32, TierStats>,
    pub total_queued: usize,
    pub total_running: usize,
    pub total_escalations: u64,
}

#[derive(Default)]
struct PriorityState {
    jobs: HashMap<String, PriorityJobEntry>,
    next_seq: u64,
    total_escalations: u64,
}

impl PriorityState {
    fn active_for_user(&self, user_id: &str) -> u32 {
        self.jobs.values().filter(|j| j.user_id == user_id).count() as u32
    }

    fn running_for_user(&self, user_id: &str) -> u32 {
        self.jobs
            .values()
            .filter(|j| j.user_id == user_id && !j.is_queued())
            .count() as u32
    }

    fn running_in_level(&self, level: u32) -> u32 {
        self.jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Running { level: l, .. } if l == level))
            .count() as u32
    }
}

/// Priority queue with tiers, quotas and escalation.
pub struct PriorityManager {
    config: PriorityConfig,
    tiers: BTreeMap<u32, PriorityTier>,
    state: Mutex<PriorityState>,
    events: EventBus,
}

impl PriorityManager {
    pub fn new(config: PriorityConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        let tiers = config
            .tiers
            .iter()
            .map(|t| (t.level, t.clone()))
            .collect();
        Ok(Self {
            config,
            tiers,
            state: Mutex::new(PriorityState::default()),
            events,
        })
    }

    pub fn tiers(&self) -> impl Iterator<Item = &PriorityTier> {
        self.tiers.values()
    }

    pub fn add_job(&self, job: JobSubmission) -> Result<PriorityJobEntry, AdmissionError> {
        self.add_job_at(job, Instant::now())
    }

    /// Admit a job into its tier, or reject it on quota.
    pub fn add_job_at(
        &self,
        job: JobSubmission,
        now: Instant,
    ) -> Result<PriorityJobEntry, AdmissionError> {
        if !self.tiers.contains_key(&job.priority) {
            return Err(AdmissionError::UnknownLevel(job.priority));
        }

        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.job_id) {
            return Err(AdmissionError::DuplicateJob(job.job_id));
        }

        let active = state.active_for_user(&job.user_id);
        if active >= self.config.max_jobs_per_user {
            debug!(user_id = %job.user_id, active, "Job rejected by user quota");
            return Err(AdmissionError::QuotaExceeded {
                user_id: job.user_id,
                active,
                limit: self.config.max_jobs_per_user,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = PriorityJobEntry {
            job_id: job.job_id.clone(),
            user_id: job.user_id,
            original_level: job.priority,
            current_level: job.priority,
            escalation_count: 0,
            escalated: false,
            capabilities: job.capabilities,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            enqueued_at: now,
            seq,
        };
        state.jobs.insert(job.job_id, entry.clone());
        debug!(job_id = %entry.job_id, level = entry.current_level, "Job admitted");
        Ok(entry)
    }

    /// Pick the next job and reserve a slot for it in its tier.
    ///
    /// The most urgent tier with queued work and free concurrency wins;
    /// inside it, the user with the fewest running jobs goes first, ties
    /// broken by enqueue order.
    pub fn select_next(&self) -> Option<PriorityJobEntry> {
        let mut state = self.state.lock();

        let level = self.tiers.values().find_map(|tier| {
            let has_queued = state
                .jobs
                .values()
                .any(|j| j.is_queued() && j.current_level == tier.level);
            let has_room = state.running_in_level(tier.level) < tier.max_concurrent;
            (has_queued && has_room).then_some(tier.level)
        })?;

        let job_id = state
            .jobs
            .values()
            .filter(|j| j.is_queued() && j.current_level == level)
            .min_by_key(|j| (state.running_for_user(&j.user_id), j.enqueued_at, j.seq))
            .map(|j| j.job_id.clone())?;

        let entry = state.jobs.get_mut(&job_id)?;
        entry.state = JobState::Running {
            level,
            node_id: None,
        };
        Some(entry.clone())
    }

    /// Record the node a selected job was dispatched to.
    pub fn mark_assigned(&self, job_id: &str, node_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.jobs.get_mut(job_id) {
            Some(PriorityJobEntry {
                state: JobState::Running { node_id: slot, .. },
                ..
            }) => {
                *slot = Some(node_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Return a selected job to its queue, keeping its original enqueue time.
    pub fn requeue(&self, job_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.jobs.get_mut(job_id) {
            Some(entry) if !entry.is_queued() => {
                entry.state = JobState::Queued;
                true
            }
            _ => false,
        }
    }

    /// Remove a finished job, releasing its slot.
    pub fn complete(&self, job_id: &str) -> Option<PriorityJobEntry> {
        self.state.lock().jobs.remove(job_id)
    }

    /// Remove a job whether queued or running.
    pub fn cancel(&self, job_id: &str) -> Option<PriorityJobEntry> {
        let removed = self.state.lock().jobs.remove(job_id);
        if removed.is_some() {
            debug!(job_id = %job_id, "Job cancelled");
        }
        removed
    }

    pub fn get(&self, job_id: &str) -> Option<PriorityJobEntry> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn escalate(&self) -> Vec<PriorityJobEntry> {
        self.escalate_at(Instant::now())
    }

    /// Escalation sweep.
    ///
    /// A queued job moves up one level when it has waited longer than the
    /// `max_wait` of the tier it would move into. At most one level per
    /// sweep; level 0 is the floor.
    pub fn escalate_at(&self, now: Instant) -> Vec<PriorityJobEntry> {
        let escalated: Vec<PriorityJobEntry> = {
            let mut state = self.state.lock();
            let mut escalated = Vec::new();

            for entry in state.jobs.values_mut() {
                if !entry.is_queued() || entry.current_level == 0 {
                    continue;
                }
                let target = entry.current_level - 1;
                let Some(tier) = self.tiers.get(&target) else {
                    continue;
                };
                if now.saturating_duration_since(entry.enqueued_at) > tier.max_wait {
                    entry.current_level = target;
                    entry.escalation_count += 1;
                    entry.escalated = true;
                    escalated.push(entry.clone());
                }
            }

            state.total_escalations += escalated.len() as u64;
            escalated
        };

        for entry in &escalated {
            info!(
                job_id = %entry.job_id,
                user_id = %entry.user_id,
                level = entry.current_level,
                "Job escalated"
            );
            self.events.publish(ClusterEvent::JobEscalated {
                job_id: entry.job_id.clone(),
                user_id: entry.user_id.clone(),
                from_level: entry.current_level + 1,
                to_level: entry.current_level,
            });
        }
        escalated
    }

    /// Jobs waiting for a slot.
    pub fn queue_depth(&self) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_queued())
            .count()
    }

    pub fn stats(&self) -> PriorityStats {
        let state = self.state.lock();
        let mut stats = PriorityStats {
            total_escalations: state.total_escalations,
            ..Default::default()
        };

        for tier in self.tiers.values() {
            stats.tiers.insert(
                tier.level,
                TierStats {
                    max_concurrent: tier.max_concurrent,
                    ..Default::default()
                },
            );
        }

        for job in state.jobs.values() {
            match &job.state {
                JobState::Queued => {
                    stats.total_queued += 1;
                    if let Some(t) = stats.tiers.get_mut(&job.current_level) {
                        t.queued += 1;
                    }
                }
                JobState::Running { level, .. } => {
                    stats.total_running += 1;
                    if let Some(t) = stats.tiers.get_mut(level) {
                        t.running += 1;
                    }
                }
            }
        }
        stats
    }
}

impl std::fmt::Debug for PriorityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityManager")
            .field("tiers", &self.tiers.len())
            .field("max_jobs_per_user", &self.config.max_jobs_per_user)
            .finish_non_exhaustive()
    }
}
