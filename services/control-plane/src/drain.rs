//! Graceful node retirement.
//!
//! ```text
//! (active) -> Draining -> Drained
//!                 \-> ForceDraining -> Drained   (timeout)
//! ```
//!
//! Active nodes have no entry. A drain with no running jobs completes at
//! once; otherwise a timer is armed and the drain either reaches zero jobs
//! through [`DrainManager::job_completed`] or is forced when the timer fires.
//! `cancel_drain` and `re_enable` both delete the entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{ClusterEvent, DrainStatus};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::EventBus;

/// Default time a drain waits for jobs before forcing.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("node {0} already has a drain entry")]
    AlreadyDraining(String),

    #[error("node {0} is not draining")]
    NotDraining(String),

    /// Re-enable is only valid once the drain finished.
    #[error("node {0} is not drained")]
    NotDrained(String),
}

/// Parameters for starting a drain.
#[derive(Debug, Clone, Default)]
pub struct DrainRequest {
    /// Falls back to the manager default.
    pub timeout: Option<Duration>,
    pub initiated_by: String,
    pub reason: Option<String>,
}

impl DrainRequest {
    pub fn by(initiated_by: impl Into<String>) -> Self {
        Self {
            initiated_by: initiated_by.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainEntry {
    pub node_id: String,
    pub status: DrainStatus,
    pub initial_jobs: u32,
    pub remaining_jobs: u32,
    pub timeout_ms: u64,
    pub initiated_by: String,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub forced: bool,
}

impl DrainEntry {
    /// Completed share of the initial jobs, 0-100.
    pub fn progress(&self) -> f64 {
        if self.initial_jobs == 0 {
            return 100.0;
        }
        let done = self.initial_jobs.saturating_sub(self.remaining_jobs);
        f64::from(done) / f64::from(self.initial_jobs) * 100.0
    }
}

struct DrainSlot {
    entry: DrainEntry,
    timer: Option<JoinHandle<()>>,
}

impl DrainSlot {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct DrainInner {
    default_timeout: Duration,
    drains: Mutex<HashMap<String, DrainSlot>>,
    events: EventBus,
}

/// Tracks drains. Cloning shares the same table.
#[derive(Clone)]
pub struct DrainManager {
    inner: Arc<DrainInner>,
}

impl DrainManager {
    pub fn new(default_timeout: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(DrainInner {
                default_timeout,
                drains: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Begin draining a node that has `running_jobs` in flight.
    ///
    /// Must be called inside a tokio runtime when `running_jobs > 0`.
    pub fn start_drain(
        &self,
        node_id: &str,
        running_jobs: u32,
        request: DrainRequest,
    ) -> Result<DrainEntry, DrainError> {
        let timeout = request.timeout.unwrap_or(self.inner.default_timeout);
        let now = Utc::now();

        let entry = {
            let mut drains = self.inner.drains.lock();
            if drains.contains_key(node_id) {
                return Err(DrainError::AlreadyDraining(node_id.to_string()));
            }

            let mut entry = DrainEntry {
                node_id: node_id.to_string(),
                status: DrainStatus::Draining,
                initial_jobs: running_jobs,
                remaining_jobs: running_jobs,
                timeout_ms: timeout.as_millis() as u64,
                initiated_by: request.initiated_by,
                reason: request.reason,
                started_at: now,
                completed_at: None,
                forced: false,
            };

            let timer = if running_jobs == 0 {
                entry.status = DrainStatus::Drained;
                entry.completed_at = Some(now);
                None
            } else {
                Some(self.arm_timer(node_id, timeout))
            };

            drains.insert(
                node_id.to_string(),
                DrainSlot {
                    entry: entry.clone(),
                    timer,
                },
            );
            entry
        };

        info!(
            node_id = %node_id,
            running_jobs,
            timeout_ms = entry.timeout_ms,
            initiated_by = %entry.initiated_by,
            "Drain started"
        );
        self.inner.events.publish(ClusterEvent::DrainStarted {
            node_id: node_id.to_string(),
            initial_jobs: running_jobs,
            timeout_ms: entry.timeout_ms,
            initiated_by: entry.initiated_by.clone(),
            reason: entry.reason.clone(),
        });
        if entry.status == DrainStatus::Drained {
            self.announce_completed(node_id, false);
        }
        Ok(entry)
    }

    fn arm_timer(&self, node_id: &str, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<DrainInner> = Arc::downgrade(&self.inner);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let manager = DrainManager { inner };
                manager.expire(&node_id);
            }
        })
    }

    fn expire(&self, node_id: &str) {
        {
            let mut drains = self.inner.drains.lock();
            match drains.get_mut(node_id) {
                Some(slot) if slot.entry.status == DrainStatus::Draining => {
                    // This task is the timer; detach instead of aborting it.
                    slot.timer = None;
                }
                _ => return,
            }
        }
        warn!(node_id = %node_id, "Drain timed out");
        let _ = self.force_drain(node_id);
    }

    /// Report the jobs still running on a draining node.
    ///
    /// Returns the updated entry, or `None` when the node is not draining.
    pub fn job_completed(&self, node_id: &str, remaining_jobs: u32) -> Option<DrainEntry> {
        let (entry, completed) = {
            let mut drains = self.inner.drains.lock();
            let slot = drains.get_mut(node_id)?;
            if slot.entry.status != DrainStatus::Draining {
                return None;
            }

            slot.entry.remaining_jobs = remaining_jobs.min(slot.entry.initial_jobs);
            let completed = slot.entry.remaining_jobs == 0;
            if completed {
                slot.clear_timer();
                slot.entry.status = DrainStatus::Drained;
                slot.entry.completed_at = Some(Utc::now());
            }
            (slot.entry.clone(), completed)
        };

        self.inner.events.publish(ClusterEvent::DrainProgress {
            node_id: node_id.to_string(),
            remaining_jobs: entry.remaining_jobs,
            percent: entry.progress(),
        });
        if completed {
            self.announce_completed(node_id, false);
        }
        Some(entry)
    }

    /// Stop waiting and complete the drain; remaining jobs are presumed
    /// terminated by the caller.
    pub fn force_drain(&self, node_id: &str) -> Result<DrainEntry, DrainError> {
        let entry = {
            let mut drains = self.inner.drains.lock();
            let slot = drains
                .get_mut(node_id)
                .filter(|s| s.entry.status == DrainStatus::Draining)
                .ok_or_else(|| DrainError::NotDraining(node_id.to_string()))?;

            slot.clear_timer();
            slot.entry.status = DrainStatus::ForceDraining;
            warn!(
                node_id = %node_id,
                remaining_jobs = slot.entry.remaining_jobs,
                "Force draining node"
            );

            slot.entry.status = DrainStatus::Drained;
            slot.entry.forced = true;
            slot.entry.completed_at = Some(Utc::now());
            slot.entry.clone()
        };

        self.announce_completed(node_id, true);
        Ok(entry)
    }

    /// Abandon an in-progress drain, returning the node to active.
    pub fn cancel_drain(&self, node_id: &str) -> Result<DrainEntry, DrainError> {
        let entry = {
            let mut drains = self.inner.drains.lock();
            match drains.get(node_id) {
                Some(slot) if slot.entry.status != DrainStatus::Drained => {}
                _ => return Err(DrainError::NotDraining(node_id.to_string())),
            }
            let mut slot = drains
                .remove(node_id)
                .ok_or_else(|| DrainError::NotDraining(node_id.to_string()))?;
            slot.clear_timer();
            slot.entry
        };

        info!(node_id = %node_id, "Drain cancelled");
        self.inner.events.publish(ClusterEvent::DrainCancelled {
            node_id: node_id.to_string(),
        });
        Ok(entry)
    }

    /// Return a drained node to service.
    pub fn re_enable(&self, node_id: &str) -> Result<(), DrainError> {
        let mut drains = self.inner.drains.lock();
        match drains.get(node_id) {
            Some(slot) if slot.entry.status == DrainStatus::Drained => {
                drains.remove(node_id);
                info!(node_id = %node_id, "Node re-enabled");
                Ok(())
            }
            _ => Err(DrainError::NotDrained(node_id.to_string())),
        }
    }

    fn announce_completed(&self, node_id: &str, forced: bool) {
        info!(node_id = %node_id, forced, "Drain completed");
        self.inner.events.publish(ClusterEvent::DrainCompleted {
            node_id: node_id.to_string(),
            forced,
        });
    }

    pub fn get(&self, node_id: &str) -> Option<DrainEntry> {
        self.inner
            .drains
            .lock()
            .get(node_id)
            .map(|s| s.entry.clone())
    }

    pub fn status(&self, node_id: &str) -> Option<DrainStatus> {
        self.inner.drains.lock().get(node_id).map(|s| s.entry.status)
    }

    pub fn progress(&self, node_id: &str) -> Option<f64> {
        self.inner
            .drains
            .lock()
            .get(node_id)
            .map(|s| s.entry.progress())
    }

    /// Whether the node has any drain entry, finished or not.
    pub fn has_entry(&self, node_id: &str) -> bool {
        self.inner.drains.lock().contains_key(node_id)
    }

    /// Drains still waiting on jobs, ordered by node id.
    pub fn active_drains(&self) -> Vec<DrainEntry> {
        let mut active: Vec<DrainEntry> = self
            .inner
            .drains
            .lock()
            .values()
            .filter(|s| s.entry.status != DrainStatus::Drained)
            .map(|s| s.entry.clone())
            .collect();
        active.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        active
    }
}

impl std::fmt::Debug for DrainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainManager")
            .field("default_timeout", &self.inner.default_timeout)
            .field("drains", &self.inner.drains.lock().len())
            .finish()
    }
}
