//! Host metrics backed by `sysinfo`.

use fleet_health::{MetricsError, MetricsSource, RawMetrics};
use sysinfo::{Disks, System};

/// Reads load averages, memory and disk usage from the local host.
pub struct SysinfoSource {
    system: System,
    disks: Disks,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self) -> Result<RawMetrics, MetricsError> {
        self.system.refresh_memory();
        self.disks.refresh();

        let load = System::load_average();
        let cpu_count = match self.system.cpus().len() {
            0 => self.system.physical_core_count().unwrap_or(0),
            n => n,
        };
        if cpu_count == 0 {
            return Err(MetricsError::Unavailable("cpu count".into()));
        }

        let memory_used_percent =
            used_percent(self.system.used_memory(), self.system.total_memory())
                .ok_or_else(|| MetricsError::Unavailable("memory".into()))?;

        let disk_used_percent = disk_used_percent(
            self.disks
                .list()
                .iter()
                .map(|d| (d.total_space(), d.available_space())),
        );

        Ok(RawMetrics {
            load_average: [load.one, load.five, load.fifteen],
            cpu_count,
            memory_used_percent,
            disk_used_percent,
        })
    }
}

fn used_percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((used as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

/// Used space across all mounts as a share of their combined size.
///
/// Hosts without any reported disk count as empty.
fn disk_used_percent(disks: impl IntoIterator<Item = (u64, u64)>) -> f64 {
    let (total, available) = disks
        .into_iter()
        .fold((0u64, 0u64), |(t, a), (total, available)| {
            (t.saturating_add(total), a.saturating_add(available.min(total)))
        });
    used_percent(total - available, total).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(50, 100, Some(50.0))]
    #[case(0, 100, Some(0.0))]
    #[case(100, 100, Some(100.0))]
    #[case(1, 0, None)]
    fn test_used_percent(#[case] used: u64, #[case] total: u64, #[case] expected: Option<f64>) {
        assert_eq!(used_percent(used, total), expected);
    }

    #[test]
    fn test_disk_usage_is_weighted_by_size() {
        // 10 GB at 90% used and 90 GB at 10% used.
        let percent = disk_used_percent([(10, 1), (90, 81)]);
        assert!((percent - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_disks_reads_as_empty() {
        assert_eq!(disk_used_percent([]), 0.0);
    }

    #[test]
    fn test_available_above_total_is_clamped() {
        assert_eq!(disk_used_percent([(10, 20)]), 0.0);
    }

    #[test]
    fn test_samples_local_host() {
        let metrics = SysinfoSource::new().sample().unwrap();
        assert!(metrics.cpu_count > 0);
        assert!((0.0..=100.0).contains(&metrics.memory_used_percent));
        assert!((0.0..=100.0).contains(&metrics.disk_used_percent));
    }
}
