//! Docker Engine adapter built on `bollard`.

use crate::policy::cpus_to_nano;
use crate::runtime::{ContainerRuntime, LogStream, PullStream, RuntimeError};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{
    ContainerInspectResponse, DeviceMapping, EndpointSettings, HostConfig,
    PortBinding as DockerPortBinding,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use studio_core::types::{
    ContainerDetail, ContainerStatus, ContainerSummary, NetworkSummary, PortBinding,
    PullProgress, RunContainerResult, RunContainerSpec,
};
use tracing::{debug, warn};

/// How a 409 from the engine should be reported for a given call.
#[derive(Clone, Copy)]
enum Conflict {
    AlreadyExists,
    InUse,
    StillRunning,
}

fn map_error(e: DockerError, what: &str, conflict: Conflict) -> RuntimeError {
    match e {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeError::not_found(what),
            409 | 403 => match conflict {
                Conflict::AlreadyExists => RuntimeError::AlreadyExists {
                    what: what.to_string(),
                },
                Conflict::InUse => RuntimeError::InUse {
                    what: what.to_string(),
                },
                Conflict::StillRunning => RuntimeError::StillRunning {
                    id: what.to_string(),
                },
            },
            400 => RuntimeError::Rejected { message },
            _ => RuntimeError::Other {
                message: format!("HTTP {status_code}: {message}"),
            },
        },
        DockerError::RequestTimeoutError => RuntimeError::Timeout {
            operation: what.to_string(),
            timeout_secs: 0,
        },
        DockerError::IOError { err } => RuntimeError::Unavailable {
            message: err.to_string(),
        },
        DockerError::SocketNotFoundError(path) => RuntimeError::Unavailable {
            message: format!("socket {path} not found"),
        },
        DockerError::HyperResponseError { err } => RuntimeError::Unavailable {
            message: err.to_string(),
        },
        other => {
            let message = other.to_string();
            if message.contains("connect") || message.contains("socket") {
                RuntimeError::Unavailable { message }
            } else {
                RuntimeError::Other { message }
            }
        }
    }
}

fn not_found_is_false(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// A [`ContainerRuntime`] talking to the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `endpoint` (`unix:///path`, `tcp://host:port`, a bare
    /// socket path, or empty for the local default).
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, RuntimeError> {
        let secs = timeout.as_secs().max(1);
        let docker = if endpoint.is_empty() {
            Docker::connect_with_local_defaults()
        } else if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(path, secs, bollard::API_DEFAULT_VERSION)
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, secs, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_socket(endpoint, secs, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::Unavailable {
            message: format!("cannot connect to {endpoint}: {e}"),
        })?;
        debug!(endpoint, "Docker client configured");
        Ok(Self { docker })
    }

    async fn inspect_raw(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(e, &format!("container {id}"), Conflict::AlreadyExists))
    }
}

fn summary_from_docker(c: bollard::models::ContainerSummary) -> ContainerSummary {
    let ports = c
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            let proto = p.typ.map(|t| t.to_string()).unwrap_or_else(|| "tcp".into());
            p.public_port.map(|host_port| PortBinding {
                container_port: format!("{}/{}", p.private_port, proto),
                host_ip: p.ip,
                host_port,
            })
        })
        .collect();
    ContainerSummary {
        id: c.id.unwrap_or_default(),
        name: c
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status: ContainerStatus::parse(&c.state.map(|s| s.to_string()).unwrap_or_default()),
        image: c.image.unwrap_or_default(),
        created: c.created.unwrap_or_default(),
        ports,
        networks: c
            .network_settings
            .and_then(|s| s.networks)
            .map(|n| n.into_keys().collect())
            .unwrap_or_default(),
        labels: c.labels.unwrap_or_default().into_iter().collect(),
    }
}

fn detail_from_docker(r: ContainerInspectResponse) -> ContainerDetail {
    let state = r.state.unwrap_or_default();
    let config = r.config.unwrap_or_default();
    let settings = r.network_settings.unwrap_or_default();

    let mut ports = Vec::new();
    for (container_port, bindings) in settings.ports.unwrap_or_default() {
        for binding in bindings.unwrap_or_default() {
            if let Some(host_port) = binding.host_port.and_then(|p| p.parse().ok()) {
                ports.push(PortBinding {
                    container_port: container_port.clone(),
                    host_ip: binding.host_ip,
                    host_port,
                });
            }
        }
    }
    let created = r
        .created
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(&c).ok())
        .map(|t| t.timestamp())
        .unwrap_or_default();

    ContainerDetail {
        summary: ContainerSummary {
            id: r.id.unwrap_or_default(),
            name: r
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status: ContainerStatus::parse(&state.status.map(|s| s.to_string()).unwrap_or_default()),
            image: config.image.unwrap_or_default(),
            created,
            ports,
            networks: settings
                .networks
                .map(|n| n.into_keys().collect())
                .unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        },
        exit_code: state.exit_code,
        started_at: state.started_at,
        finished_at: state.finished_at,
        restart_count: r.restart_count.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        error: state.error.filter(|e| !e.is_empty()),
    }
}

fn create_config(spec: &RunContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .keys()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();
    let port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = spec
        .ports
        .iter()
        .map(|(port, host_port)| {
            (
                port.clone(),
                Some(vec![DockerPortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect();
    let devices = spec
        .devices
        .iter()
        .map(|path| DeviceMapping {
            path_on_host: Some(path.clone()),
            path_in_container: Some(path.clone()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone().into_iter().collect()),
        cmd: spec.command.clone(),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(spec.volumes.iter().map(|v| v.to_bind()).collect()),
            devices: Some(devices),
            shm_size: spec.shm_size,
            memory: spec.memory,
            nano_cpus: spec.cpus.map(cpus_to_nano),
            privileged: Some(false),
            network_mode: spec.network.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, "docker daemon", Conflict::AlreadyExists))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error(e, "containers", Conflict::AlreadyExists))?;
        Ok(containers.into_iter().map(summary_from_docker).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        self.inspect_raw(id).await.map(detail_from_docker)
    }

    async fn run_container(
        &self,
        spec: &RunContainerSpec,
    ) -> Result<RunContainerResult, RuntimeError> {
        let what = format!(
            "container {}",
            spec.name.as_deref().unwrap_or(spec.image.as_str())
        );
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        let created = self
            .docker
            .create_container(options, create_config(spec))
            .await
            .map_err(|e| map_error(e, &what, Conflict::AlreadyExists))?;
        for warning in &created.warnings {
            warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let err = map_error(e, &what, Conflict::AlreadyExists);
            warn!(container_id = %created.id, error = %err, "Start failed, removing container");
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(err);
        }

        let detail = self.inspect_container(&created.id).await?;
        Ok(RunContainerResult {
            id: created.id,
            name: detail.summary.name,
            port_bindings: spec.ports.clone(),
        })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let detail = self.inspect_container(id).await?;
        if !detail.summary.status.is_alive() {
            return Ok(());
        }
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e, &format!("container {id}"), Conflict::AlreadyExists)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        if !force {
            let detail = self.inspect_container(id).await?;
            if detail.summary.status.is_alive() {
                return Err(RuntimeError::StillRunning { id: id.to_string() });
            }
        }
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_error(e, id, Conflict::StillRunning))
    }

    async fn image_exists(&self, name: &str, tag: &str) -> Result<bool, RuntimeError> {
        let reference = format!("{name}:{tag}");
        match self.docker.inspect_image(&reference).await {
            Ok(_) => Ok(true),
            Err(e) if not_found_is_false(&e) => Ok(false),
            Err(e) => Err(map_error(e, &reference, Conflict::AlreadyExists)),
        }
    }

    async fn remove_image(&self, name: &str, tag: &str, force: bool) -> Result<(), RuntimeError> {
        let reference = format!("{name}:{tag}");
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(&reference, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, &format!("image {reference}"), Conflict::InUse))
    }

    fn pull_image(&self, name: &str, tag: &str) -> PullStream {
        let docker = self.docker.clone();
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let what = format!("image {name}:{tag}");
        Box::pin(async_stream::stream! {
            let mut upstream = Box::pin(docker.create_image(Some(options), None, None));
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            yield Err(RuntimeError::Other { message: error });
                            return;
                        }
                        yield Ok(PullProgress {
                            id: info.id,
                            status: info.status,
                            progress: info.progress,
                        });
                    }
                    Err(e) => {
                        yield Err(map_error(e, &what, Conflict::AlreadyExists));
                        return;
                    }
                }
            }
        })
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| map_error(e, "networks", Conflict::AlreadyExists))?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                containers: n
                    .containers
                    .map(|c| c.into_keys().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(
        &self,
        name: &str,
        driver: Option<&str>,
    ) -> Result<NetworkSummary, RuntimeError> {
        let what = format!("network {name}");
        if self.list_networks().await?.iter().any(|n| n.name == name) {
            return Err(RuntimeError::AlreadyExists { what });
        }
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: driver.unwrap_or("bridge").to_string(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| map_error(e, &what, Conflict::AlreadyExists))?;
        self.list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| RuntimeError::not_found(what))
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| map_error(e, &format!("network {name}"), Conflict::InUse))
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| {
                map_error(
                    e,
                    &format!("endpoint {container} on {network}"),
                    Conflict::AlreadyExists,
                )
            })
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        self.docker
            .disconnect_network(network, options)
            .await
            .map_err(|e| {
                map_error(
                    e,
                    &format!("endpoint {container} on {network}"),
                    Conflict::InUse,
                )
            })
    }

    fn logs(&self, id: &str, follow: bool, tail: Option<usize>) -> LogStream {
        let docker = self.docker.clone();
        let id = id.to_string();
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };
        Box::pin(async_stream::stream! {
            let mut upstream = Box::pin(docker.logs(&id, Some(options)));
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(output) => yield Ok(output.into_bytes()),
                    Err(e) => {
                        yield Err(map_error(e, &format!("container {id}"), Conflict::AlreadyExists));
                        return;
                    }
                }
            }
        })
    }
}
