//! Composite health probe: runtime reachability and free disk space.

use crate::runtime::ContainerRuntime;
use std::path::{Path, PathBuf};
use std::time::Duration;
use studio_core::types::{HealthCheck, HealthReport, HealthStatus};
use sysinfo::Disks;

/// Bound on the runtime ping during a health probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Free space on the filesystem holding `path`, as a percentage.
pub fn disk_free_percent(path: &Path) -> std::io::Result<f64> {
    let path = path.canonicalize()?;
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<Mount> = disks
        .list()
        .iter()
        .map(|d| Mount {
            mount_point: d.mount_point().to_path_buf(),
            total: d.total_space(),
            available: d.available_space(),
        })
        .collect();
    free_percent_on(&path, &mounts).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no mounted disk holds {}", path.display()),
        )
    })
}

/// One mounted filesystem as reported by the OS.
#[derive(Debug, Clone)]
pub struct Mount {
    pub mount_point: PathBuf,
    pub total: u64,
    pub available: u64,
}

/// Free percentage of the mount with the longest mount point containing
/// `path`.
pub fn free_percent_on(path: &Path, mounts: &[Mount]) -> Option<f64> {
    let mount = mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())?;
    if mount.total == 0 {
        return Some(0.0);
    }
    Some(mount.available as f64 / mount.total as f64 * 100.0)
}

/// Probe the runtime.
pub async fn runtime_check(runtime: &dyn ContainerRuntime) -> HealthCheck {
    let (status, detail) = match tokio::time::timeout(PING_TIMEOUT, runtime.ping()).await {
        Ok(Ok(())) => (HealthStatus::Healthy, "container runtime reachable".to_string()),
        Ok(Err(e)) => (HealthStatus::Unhealthy, e.to_string()),
        Err(_) => (
            HealthStatus::Unhealthy,
            format!("runtime ping timed out after {}s", PING_TIMEOUT.as_secs()),
        ),
    };
    HealthCheck {
        name: "runtime".to_string(),
        status,
        detail,
    }
}

/// Grade a free-space measurement against the warning threshold.
pub fn disk_check_from(free: std::io::Result<f64>, path: &Path, warn_percent: f64) -> HealthCheck {
    let (status, detail) = match free {
        Ok(pct) if pct < warn_percent => (
            HealthStatus::Degraded,
            format!(
                "{pct:.1}% free on {} (below {warn_percent}%)",
                path.display()
            ),
        ),
        Ok(pct) => (
            HealthStatus::Healthy,
            format!("{pct:.1}% free on {}", path.display()),
        ),
        Err(e) => (
            HealthStatus::Degraded,
            format!("cannot read disk usage of {}: {e}", path.display()),
        ),
    };
    HealthCheck {
        name: "disk".to_string(),
        status,
        detail,
    }
}

/// Run every sub-check. `unhealthy` when the runtime is down, `degraded`
/// when disk space is low.
pub async fn probe(runtime: &dyn ContainerRuntime, disk_path: &Path, warn_percent: f64) -> HealthReport {
    let runtime = runtime_check(runtime).await;
    let disk = disk_check_from(disk_free_percent(disk_path), disk_path, warn_percent);
    HealthReport::from_checks(vec![runtime, disk])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRuntime;

    #[test]
    fn test_disk_thresholds() {
        let path = Path::new("/data");
        assert_eq!(
            disk_check_from(Ok(50.0), path, 10.0).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            disk_check_from(Ok(5.0), path, 10.0).status,
            HealthStatus::Degraded
        );
        let err = std::io::Error::other("boom");
        assert_eq!(
            disk_check_from(Err(err), path, 10.0).status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_free_percent_picks_deepest_mount() {
        let mounts = vec![
            Mount {
                mount_point: PathBuf::from("/"),
                total: 1000,
                available: 900,
            },
            Mount {
                mount_point: PathBuf::from("/var/lib"),
                total: 1000,
                available: 50,
            },
            Mount {
                mount_point: PathBuf::from("/var/library"),
                total: 1000,
                available: 1000,
            },
        ];
        let pct = free_percent_on(Path::new("/var/lib/tt-studio"), &mounts).unwrap();
        assert!((pct - 5.0).abs() < 1e-9);
        let pct = free_percent_on(Path::new("/home"), &mounts).unwrap();
        assert!((pct - 90.0).abs() < 1e-9);
        assert_eq!(free_percent_on(Path::new("relative"), &mounts), None);
    }

    #[test]
    fn test_free_percent_of_empty_disk_is_zero() {
        let mounts = vec![Mount {
            mount_point: PathBuf::from("/"),
            total: 0,
            available: 0,
        }];
        assert_eq!(free_percent_on(Path::new("/x"), &mounts), Some(0.0));
    }

    #[test]
    fn test_disk_free_percent_of_missing_path() {
        assert!(disk_free_percent(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn test_disk_free_percent_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        // Sandboxes may expose no real mounts at all.
        if let Ok(pct) = disk_free_percent(dir.path()) {
            assert!((0.0..=100.0).contains(&pct));
        }
    }

    #[tokio::test]
    async fn test_health_reports_runtime_outage() {
        let rt = InMemoryRuntime::new();
        let dir = tempfile::tempdir().unwrap();
        assert_ne!(probe(&rt, dir.path(), 0.0).await.status, HealthStatus::Unhealthy);
        rt.set_available(false);
        let report = probe(&rt, dir.path(), 0.0).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks[0].name, "runtime");
    }
}
