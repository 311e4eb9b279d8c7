//! Health and load monitoring.
//!
//! A [`HealthMonitor`] samples host metrics through a [`MetricsSource`],
//! classifies each metric against `{degraded, unhealthy}` thresholds and
//! tracks alerts per component:
//!
//! - An alert is raised when a metric crosses a threshold (and re-raised only
//!   if it gets worse, so repeated breaches do not duplicate).
//! - The alert resolves once the metric falls back below the degraded
//!   threshold.
//!
//! The node status is the worst of its component statuses. Across nodes,
//! [`ClusterHealthSummary`] counts statuses and reports the cluster-worst one.

mod monitor;

pub use monitor::{AlertEvent, HealthMonitor};

use chrono::{DateTime, Utc};
use fleet_events::HealthStatus;
use serde::Serialize;
use thiserror::Error;

/// Errors reading host metrics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricsError {
    #[error("metric unavailable: {0}")]
    Unavailable(String),
}

/// Source of raw host metrics.
pub trait MetricsSource: Send {
    fn sample(&mut self) -> Result<RawMetrics, MetricsError>;
}

/// A single unclassified sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawMetrics {
    /// 1, 5 and 15 minute load averages.
    pub load_average: [f64; 3],
    pub cpu_count: usize,
    pub memory_used_percent: f64,
    pub disk_used_percent: f64,
}

impl RawMetrics {
    /// One-minute load average as a percentage of available CPUs.
    pub fn cpu_load_percent(&self) -> f64 {
        let cpus = self.cpu_count.max(1) as f64;
        self.load_average[0] / cpus * 100.0
    }
}

/// Monitored host component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Cpu,
    Memory,
    Disk,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Cpu => "cpu",
            Component::Memory => "memory",
            Component::Disk => "disk",
        };
        write!(f, "{}", s)
    }
}

/// Degraded/unhealthy cut-offs for one metric, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub degraded: f64,
    pub unhealthy: f64,
}

impl Thresholds {
    pub const fn new(degraded: f64, unhealthy: f64) -> Self {
        Self {
            degraded,
            unhealthy,
        }
    }

    pub fn classify(&self, value: f64) -> HealthStatus {
        if value >= self.unhealthy {
            HealthStatus::Unhealthy
        } else if value >= self.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// The threshold a value at `status` has crossed.
    fn crossed(&self, status: HealthStatus) -> f64 {
        match status {
            HealthStatus::Unhealthy => self.unhealthy,
            _ => self.degraded,
        }
    }
}

/// Thresholds for every monitored component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub cpu: Thresholds,
    pub memory: Thresholds,
    pub disk: Thresholds,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu: Thresholds::new(70.0, 90.0),
            memory: Thresholds::new(75.0, 90.0),
            disk: Thresholds::new(80.0, 95.0),
        }
    }
}

impl HealthThresholds {
    pub fn for_component(&self, component: Component) -> Thresholds {
        match component {
            Component::Cpu => self.cpu,
            Component::Memory => self.memory,
            Component::Disk => self.disk,
        }
    }
}

/// Classified value of one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub value: f64,
    pub status: HealthStatus,
}

/// Result of classifying one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Worst of the component statuses.
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub metrics: RawMetrics,
    pub sampled_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}

/// Classify raw metrics into a report.
pub fn classify(
    metrics: &RawMetrics,
    thresholds: &HealthThresholds,
    sampled_at: DateTime<Utc>,
) -> HealthReport {
    let components: Vec<ComponentHealth> = [
        (Component::Cpu, metrics.cpu_load_percent()),
        (Component::Memory, metrics.memory_used_percent),
        (Component::Disk, metrics.disk_used_percent),
    ]
    .into_iter()
    .map(|(component, value)| ComponentHealth {
        component,
        value,
        status: thresholds.for_component(component).classify(value),
    })
    .collect();

    let status = components
        .iter()
        .map(|c| c.status)
        .fold(HealthStatus::Healthy, HealthStatus::worst);

    HealthReport {
        status,
        components,
        metrics: *metrics,
        sampled_at,
    }
}

/// Cluster-wide status counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct ClusterHealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub total: usize,
    /// Unhealthy dominates degraded dominates unknown dominates healthy.
    pub status: HealthStatus,
}

impl ClusterHealthSummary {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        let mut summary = ClusterHealthSummary {
            status: HealthStatus::Healthy,
            ..Default::default()
        };

        for status in statuses {
            match status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            summary.total += 1;
            summary.status = summary.status.worst(status);
        }

        if summary.total == 0 {
            summary.status = HealthStatus::Unknown;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn metrics(load1: f64, cpus: usize, mem: f64, disk: f64) -> RawMetrics {
        RawMetrics {
            load_average: [load1, load1, load1],
            cpu_count: cpus,
            memory_used_percent: mem,
            disk_used_percent: disk,
        }
    }

    #[rstest]
    #[case(69.9, HealthStatus::Healthy)]
    #[case(70.0, HealthStatus::Degraded)]
    #[case(89.9, HealthStatus::Degraded)]
    #[case(90.0, HealthStatus::Unhealthy)]
    fn test_cpu_thresholds(#[case] value: f64, #[case] expected: HealthStatus) {
        assert_eq!(HealthThresholds::default().cpu.classify(value), expected);
    }

    #[test]
    fn test_load_average_normalized_by_cpu_count() {
        // load 6.0 on 8 CPUs = 75%
        let m = metrics(6.0, 8, 10.0, 10.0);
        assert!((m.cpu_load_percent() - 75.0).abs() < f64::EPSILON);

        let report = classify(&m, &HealthThresholds::default(), Utc::now());
        assert_eq!(
            report.component(Component::Cpu).unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_overall_status_is_worst_component() {
        let report = classify(
            &metrics(0.5, 4, 80.0, 96.0),
            &HealthThresholds::default(),
            Utc::now(),
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(
            report.component(Component::Memory).unwrap().status,
            HealthStatus::Degraded
        );

        let healthy = classify(
            &metrics(0.5, 4, 10.0, 10.0),
            &HealthThresholds::default(),
            Utc::now(),
        );
        assert_eq!(healthy.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_zero_cpu_count_does_not_divide_by_zero() {
        let m = metrics(0.5, 0, 0.0, 0.0);
        assert!((m.cpu_load_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cluster_summary() {
        use HealthStatus::*;

        let summary =
            ClusterHealthSummary::from_statuses([Healthy, Healthy, Unknown, Degraded]);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.status, Degraded);

        let with_unhealthy = ClusterHealthSummary::from_statuses([Degraded, Unhealthy]);
        assert_eq!(with_unhealthy.status, Unhealthy);

        let unknown_only = ClusterHealthSummary::from_statuses([Healthy, Unknown]);
        assert_eq!(unknown_only.status, Unknown);
    }

    #[test]
    fn test_empty_cluster_is_unknown() {
        let summary = ClusterHealthSummary::from_statuses(std::iter::empty());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.status, HealthStatus::Unknown);
    }
}
