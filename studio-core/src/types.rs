//! Wire types exchanged between the supervisor and the container control
//! service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label marking a container as launched by TT Studio.
pub const LABEL_MANAGED: &str = "tt-studio.managed";
/// Label carrying the deployment id of a managed container.
pub const LABEL_DEPLOY_ID: &str = "tt-studio.deploy-id";
/// Label carrying the model id of a managed container.
pub const LABEL_MODEL_ID: &str = "tt-studio.model-id";

/// Coarse container state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Removing,
    Exited,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the workload is still considered alive.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting | Self::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published port: `"7000/tcp"` inside, a host port outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_ip: Option<String>,
    pub host_port: u16,
}

/// Row of `GET /api/v1/containers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub image: String,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    /// Whether this container was launched by TT Studio.
    pub fn is_managed(&self) -> bool {
        self.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
    }

    /// First published host port, if any.
    pub fn host_port(&self) -> Option<u16> {
        self.ports.iter().map(|p| p.host_port).min()
    }
}

/// Body of `GET /api/v1/containers/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetail {
    #[serde(flatten)]
    pub summary: ContainerSummary,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub restart_count: i64,
    #[serde(default)]
    pub env: Vec<String>,
    pub error: Option<String>,
}

/// A bind mount `host:container[:ro]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host, self.container)
        } else {
            format!("{}:{}", self.host, self.container)
        }
    }
}

/// Body of `POST /api/v1/containers/run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
    /// `"7000/tcp"` -> host port.
    pub ports: BTreeMap<String, u16>,
    pub network: Option<String>,
    pub volumes: Vec<VolumeBinding>,
    /// Host device paths passed through (e.g. `/dev/tenstorrent`).
    pub devices: Vec<String>,
    pub shm_size: Option<i64>,
    pub memory: Option<i64>,
    pub cpus: Option<f64>,
    pub privileged: bool,
    pub labels: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContainerResult {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub port_bindings: BTreeMap<String, u16>,
}

/// Body of `POST /api/v1/containers/{id}/stop`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub timeout_seconds: Option<u64>,
}

/// Body of `POST /api/v1/containers/{id}/remove`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveRequest {
    pub force: bool,
}

/// A runtime network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub containers: Vec<String>,
}

/// Body of `POST /api/v1/networks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
}

/// Body of `POST /api/v1/networks/{name}/connect|disconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAttachRequest {
    pub container: String,
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /api/v1/images/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullImageRequest {
    pub name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

/// One progress record of an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

/// `{"ok": true}` acknowledgement body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub const OK: Ack = Ack { ok: true };
}

/// Overall health of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One sub-check of a health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

/// Body of `GET /api/v1/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: String,
}

impl HealthReport {
    /// Combine sub-checks; the worst one wins.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_parse() {
        assert_eq!(ContainerStatus::parse("Running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
        assert!(ContainerStatus::Paused.is_alive());
        assert!(!ContainerStatus::Exited.is_alive());
        let s: ContainerStatus = serde_json::from_str("\"oom\"").unwrap();
        assert_eq!(s, ContainerStatus::Unknown);
    }

    #[test]
    fn test_run_spec_defaults() {
        let spec: RunContainerSpec =
            serde_json::from_str(r#"{"image":"ghcr.io/tenstorrent/x:1"}"#).unwrap();
        assert_eq!(spec.image, "ghcr.io/tenstorrent/x:1");
        assert!(!spec.privileged);
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn test_volume_bind_string() {
        let v = VolumeBinding {
            host: "/data".into(),
            container: "/weights".into(),
            read_only: true,
        };
        assert_eq!(v.to_bind(), "/data:/weights:ro");
    }

    #[test]
    fn test_health_worst_wins() {
        let report = HealthReport::from_checks(vec![
            HealthCheck {
                name: "runtime".into(),
                status: HealthStatus::Healthy,
                detail: "ok".into(),
            },
            HealthCheck {
                name: "disk".into(),
                status: HealthStatus::Degraded,
                detail: "5% free".into(),
            },
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(HealthReport::from_checks(vec![]).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_detail_flattens_summary() {
        let detail = ContainerDetail {
            summary: ContainerSummary {
                id: "abc".into(),
                name: "echo1".into(),
                status: ContainerStatus::Running,
                image: "img".into(),
                created: 0,
                ports: vec![],
                networks: vec![],
                labels: BTreeMap::new(),
            },
            exit_code: None,
            started_at: None,
            finished_at: None,
            restart_count: 0,
            env: vec![],
            error: None,
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["id"], "abc");
    }
}
