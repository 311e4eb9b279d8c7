use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_events::HealthStatus;
use serde::Serialize;
use tracing::{info, warn};

use crate::{classify, Component, HealthReport, HealthThresholds, MetricsError, MetricsSource};

/// Alert transition produced by a sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    Raised {
        component: Component,
        status: HealthStatus,
        value: f64,
        threshold: f64,
    },
    Resolved {
        component: Component,
        value: f64,
    },
}

#[derive(Debug, Clone, Copy)]
struct ActiveAlert {
    status: HealthStatus,
    raised_at: DateTime<Utc>,
}

/// Samples a [`MetricsSource`] and tracks alerts keyed by component.
pub struct HealthMonitor<S> {
    source: S,
    thresholds: HealthThresholds,
    active: BTreeMap<Component, ActiveAlert>,
    last_report: Option<HealthReport>,
}

impl<S: MetricsSource> HealthMonitor<S> {
    pub fn new(source: S, thresholds: HealthThresholds) -> Self {
        Self {
            source,
            thresholds,
            active: BTreeMap::new(),
            last_report: None,
        }
    }

    /// Take one sample, classify it and update alert state.
    pub fn sample(&mut self) -> Result<(HealthReport, Vec<AlertEvent>), MetricsError> {
        let metrics = self.source.sample()?;
        let report = classify(&metrics, &self.thresholds, Utc::now());
        let events = self.observe(&report);
        Ok((report, events))
    }

    /// Update alert state from an already classified report.
    pub fn observe(&mut self, report: &HealthReport) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for component in &report.components {
            let thresholds = self.thresholds.for_component(component.component);
            let current = self.active.get(&component.component).copied();

            match (component.status, current) {
                (HealthStatus::Healthy, Some(_)) => {
                    self.active.remove(&component.component);
                    info!(
                        component = %component.component,
                        value = component.value,
                        "Health alert resolved"
                    );
                    events.push(AlertEvent::Resolved {
                        component: component.component,
                        value: component.value,
                    });
                }
                (HealthStatus::Healthy, None) => {}
                (status, existing) => {
                    let worse = existing.map_or(true, |a| status.severity() > a.status.severity());
                    if worse {
                        warn!(
                            component = %component.component,
                            status = %status,
                            value = component.value,
                            "Health alert raised"
                        );
                        self.active.insert(
                            component.component,
                            ActiveAlert {
                                status,
                                raised_at: report.sampled_at,
                            },
                        );
                        events.push(AlertEvent::Raised {
                            component: component.component,
                            status,
                            value: component.value,
                            threshold: thresholds.crossed(status),
                        });
                    }
                }
            }
        }

        self.last_report = Some(report.clone());
        events
    }

    /// Components with an unresolved alert, with their alert level and raise time.
    pub fn active_alerts(&self) -> Vec<(Component, HealthStatus, DateTime<Utc>)> {
        self.active
            .iter()
            .map(|(c, a)| (*c, a.status, a.raised_at))
            .collect()
    }

    pub fn last_report(&self) -> Option<&HealthReport> {
        self.last_report.as_ref()
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawMetrics;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<RawMetrics>);

    impl MetricsSource for Scripted {
        fn sample(&mut self) -> Result<RawMetrics, MetricsError> {
            self.0
                .pop_front()
                .ok_or_else(|| MetricsError::Unavailable("script exhausted".into()))
        }
    }

    fn mem(percent: f64) -> RawMetrics {
        RawMetrics {
            load_average: [0.1, 0.1, 0.1],
            cpu_count: 4,
            memory_used_percent: percent,
            disk_used_percent: 10.0,
        }
    }

    fn monitor(samples: &[f64]) -> HealthMonitor<Scripted> {
        HealthMonitor::new(
            Scripted(samples.iter().copied().map(mem).collect()),
            HealthThresholds::default(),
        )
    }

    #[test]
    fn test_alert_raised_once_for_repeated_breach() {
        let mut monitor = monitor(&[80.0, 82.0, 85.0]);

        let (_, first) = monitor.sample().unwrap();
        assert_eq!(
            first,
            vec![AlertEvent::Raised {
                component: Component::Memory,
                status: HealthStatus::Degraded,
                value: 80.0,
                threshold: 75.0,
            }]
        );

        let (_, second) = monitor.sample().unwrap();
        let (_, third) = monitor.sample().unwrap();
        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(monitor.active_alerts().len(), 1);
    }

    #[test]
    fn test_alert_escalates_when_worse() {
        let mut monitor = monitor(&[80.0, 95.0, 85.0]);

        monitor.sample().unwrap();
        let (report, escalated) = monitor.sample().unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(matches!(
            escalated.as_slice(),
            [AlertEvent::Raised {
                status: HealthStatus::Unhealthy,
                threshold,
                ..
            }] if *threshold == 90.0
        ));

        // Improving but still above the degraded threshold: no new event.
        let (_, improving) = monitor.sample().unwrap();
        assert!(improving.is_empty());
    }

    #[test]
    fn test_alert_resolves_below_degraded_threshold() {
        let mut monitor = monitor(&[92.0, 50.0, 40.0]);

        monitor.sample().unwrap();
        let (_, resolved) = monitor.sample().unwrap();
        assert_eq!(
            resolved,
            vec![AlertEvent::Resolved {
                component: Component::Memory,
                value: 50.0,
            }]
        );
        assert!(monitor.active_alerts().is_empty());

        let (_, quiet) = monitor.sample().unwrap();
        assert!(quiet.is_empty());
    }

    #[test]
    fn test_source_error_propagates() {
        let mut monitor = monitor(&[]);
        assert!(matches!(
            monitor.sample(),
            Err(MetricsError::Unavailable(_))
        ));
        assert!(monitor.last_report().is_none());
    }
}
