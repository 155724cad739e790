//! In-memory container runtime.
//!
//! Behaves like the Docker adapter at the trait boundary: same error variants
//! for the same situations, follow-mode logs that end when the container
//! stops. Test hooks simulate external events (a crash, a manual `docker rm`,
//! a daemon outage).

use crate::runtime::{ContainerRuntime, LogStream, PullStream, RuntimeError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use studio_core::types::{
    ContainerDetail, ContainerStatus, ContainerSummary, NetworkSummary, PortBinding,
    PullProgress, RunContainerResult, RunContainerSpec,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum LogSignal {
    Line(String),
    Stopped,
}

#[derive(Debug)]
struct MemContainer {
    summary: ContainerSummary,
    env: Vec<String>,
    exit_code: Option<i64>,
    started_at: Option<String>,
    finished_at: Option<String>,
    lines: Vec<String>,
    log_tx: broadcast::Sender<LogSignal>,
}

impl MemContainer {
    fn halt(&mut self, exit_code: i64) {
        if self.summary.status.is_alive() {
            self.summary.status = ContainerStatus::Exited;
            self.exit_code = Some(exit_code);
            self.finished_at = Some(Utc::now().to_rfc3339());
        }
        let _ = self.log_tx.send(LogSignal::Stopped);
    }

    fn detail(&self) -> ContainerDetail {
        ContainerDetail {
            summary: self.summary.clone(),
            exit_code: self.exit_code,
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            restart_count: 0,
            env: self.env.clone(),
            error: None,
        }
    }
}

#[derive(Debug)]
struct State {
    containers: BTreeMap<String, MemContainer>,
    images: BTreeSet<String>,
    networks: BTreeMap<String, NetworkSummary>,
    next_id: u64,
    available: bool,
}

impl State {
    /// Resolve an id, a name or a unique id prefix.
    fn resolve(&self, key: &str) -> Option<String> {
        if self.containers.contains_key(key) {
            return Some(key.to_string());
        }
        let key = key.trim_start_matches('/');
        if let Some((id, _)) = self.containers.iter().find(|(_, c)| c.summary.name == key) {
            return Some(id.clone());
        }
        if key.len() < 4 {
            return None;
        }
        let mut matches = self.containers.keys().filter(|id| id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(id.clone()),
            _ => None,
        }
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.available {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable {
                message: "in-memory runtime is offline".to_string(),
            })
        }
    }

    fn container(&self, key: &str) -> Result<&MemContainer, RuntimeError> {
        self.resolve(key)
            .and_then(|id| self.containers.get(&id))
            .ok_or_else(|| RuntimeError::not_found(format!("container {key}")))
    }

    fn container_mut(&mut self, key: &str) -> Result<&mut MemContainer, RuntimeError> {
        match self.resolve(key) {
            Some(id) => self
                .containers
                .get_mut(&id)
                .ok_or_else(|| RuntimeError::not_found(format!("container {key}"))),
            None => Err(RuntimeError::not_found(format!("container {key}"))),
        }
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        let mut seed = self.next_id;
        (0..4).map(|_| format!("{:016x}", splitmix64(&mut seed))).collect()
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn image_ref(name: &str, tag: &str) -> String {
    format!("{name}:{tag}")
}

/// A container runtime that lives entirely in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    /// An empty runtime with the default `bridge` network.
    pub fn new() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "bridge".to_string(),
            NetworkSummary {
                id: "bridge".to_string(),
                name: "bridge".to_string(),
                driver: "bridge".to_string(),
                containers: Vec::new(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(State {
                containers: BTreeMap::new(),
                images: BTreeSet::new(),
                networks,
                next_id: 0,
                available: true,
            })),
        }
    }

    /// Add a pre-existing network.
    pub fn with_network(self, name: &str) -> Self {
        self.lock().networks.insert(
            name.to_string(),
            NetworkSummary {
                id: format!("net-{name}"),
                name: name.to_string(),
                driver: "bridge".to_string(),
                containers: Vec::new(),
            },
        );
        self
    }

    /// Add a locally available image (`name:tag`).
    pub fn with_image(self, reference: &str) -> Self {
        self.lock().images.insert(reference.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate a daemon outage or recovery.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Simulate the workload dying on its own.
    pub fn kill(&self, key: &str) -> bool {
        let mut state = self.lock();
        match state.container_mut(key) {
            Ok(c) => {
                c.halt(137);
                true
            }
            Err(_) => false,
        }
    }

    /// Simulate `docker rm -f` performed outside TT Studio.
    pub fn vanish(&self, key: &str) -> bool {
        let mut state = self.lock();
        let Some(id) = state.resolve(key) else {
            return false;
        };
        if let Some(mut c) = state.containers.remove(&id) {
            c.halt(137);
            for net in state.networks.values_mut() {
                net.containers.retain(|member| member != &id);
            }
            true
        } else {
            false
        }
    }

    /// Append a line to a container's output.
    pub fn emit_log(&self, key: &str, line: &str) -> bool {
        let mut state = self.lock();
        match state.container_mut(key) {
            Ok(c) => {
                c.lines.push(line.to_string());
                let _ = c.log_tx.send(LogSignal::Line(line.to_string()));
                true
            }
            Err(_) => false,
        }
    }

    /// Number of containers, including stopped ones.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.lock().check_available()
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state
            .containers
            .values()
            .filter(|c| all || c.summary.status == ContainerStatus::Running)
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let state = self.lock();
        state.check_available()?;
        state.container(id).map(MemContainer::detail)
    }

    async fn run_container(
        &self,
        spec: &RunContainerSpec,
    ) -> Result<RunContainerResult, RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;

        if let Some(name) = &spec.name
            && state.resolve(name).is_some()
        {
            return Err(RuntimeError::AlreadyExists {
                what: format!("container name {name}"),
            });
        }
        if let Some(network) = &spec.network
            && !state.networks.contains_key(network)
        {
            return Err(RuntimeError::not_found(format!("network {network}")));
        }
        for host_port in spec.ports.values() {
            let taken = state.containers.values().any(|c| {
                c.summary.status.is_alive()
                    && c.summary.ports.iter().any(|p| p.host_port == *host_port)
            });
            if taken {
                return Err(RuntimeError::AlreadyExists {
                    what: format!("host port {host_port}"),
                });
            }
        }

        let id = state.allocate_id();
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("tt-{}", &id[..12]));
        let image = if spec.image.contains(':') {
            spec.image.clone()
        } else {
            image_ref(&spec.image, "latest")
        };
        state.images.insert(image);

        let networks: Vec<String> = spec.network.iter().cloned().collect();
        for net in &networks {
            if let Some(n) = state.networks.get_mut(net) {
                n.containers.push(id.clone());
            }
        }
        let ports = spec
            .ports
            .iter()
            .map(|(container_port, host_port)| PortBinding {
                container_port: container_port.clone(),
                host_ip: Some("0.0.0.0".to_string()),
                host_port: *host_port,
            })
            .collect();
        let (log_tx, _) = broadcast::channel(256);
        let now = Utc::now();
        state.containers.insert(
            id.clone(),
            MemContainer {
                summary: ContainerSummary {
                    id: id.clone(),
                    name: name.clone(),
                    status: ContainerStatus::Running,
                    image: spec.image.clone(),
                    created: now.timestamp(),
                    ports,
                    networks,
                    labels: spec.labels.clone(),
                },
                env: spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
                exit_code: None,
                started_at: Some(now.to_rfc3339()),
                finished_at: None,
                lines: Vec::new(),
                log_tx,
            },
        );

        Ok(RunContainerResult {
            id,
            name,
            port_bindings: spec.ports.clone(),
        })
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        state.container_mut(id)?.halt(0);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        let container = state.container(id)?;
        let full_id = container.summary.id.clone();
        if container.summary.status.is_alive() && !force {
            return Err(RuntimeError::StillRunning { id: id.to_string() });
        }
        if let Some(mut c) = state.containers.remove(&full_id) {
            c.halt(137);
        }
        for net in state.networks.values_mut() {
            net.containers.retain(|member| member != &full_id);
        }
        Ok(())
    }

    async fn image_exists(&self, name: &str, tag: &str) -> Result<bool, RuntimeError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.images.contains(&image_ref(name, tag)))
    }

    async fn remove_image(&self, name: &str, tag: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        let reference = image_ref(name, tag);
        if !state.images.contains(&reference) {
            return Err(RuntimeError::not_found(format!("image {reference}")));
        }
        let used = state.containers.values().any(|c| {
            c.summary.image == reference || (tag == "latest" && c.summary.image == name)
        });
        if used && !force {
            return Err(RuntimeError::InUse {
                what: format!("image {reference}"),
            });
        }
        state.images.remove(&reference);
        Ok(())
    }

    fn pull_image(&self, name: &str, tag: &str) -> PullStream {
        let reference = image_ref(name, tag);
        let available = self.lock().check_available();
        let state = self.state.clone();
        Box::pin(async_stream::stream! {
            if let Err(e) = available {
                yield Err(e);
                return;
            }
            for status in ["Pulling fs layer", "Downloading", "Download complete"] {
                yield Ok(PullProgress {
                    id: Some("layer0".to_string()),
                    status: Some(status.to_string()),
                    progress: None,
                });
            }
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .images
                .insert(reference.clone());
            yield Ok(PullProgress {
                id: None,
                status: Some(format!("Status: Downloaded newer image for {reference}")),
                progress: None,
            });
        })
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, RuntimeError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.networks.values().cloned().collect())
    }

    async fn create_network(
        &self,
        name: &str,
        driver: Option<&str>,
    ) -> Result<NetworkSummary, RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        if state.networks.contains_key(name) {
            return Err(RuntimeError::AlreadyExists {
                what: format!("network {name}"),
            });
        }
        let network = NetworkSummary {
            id: format!("net-{name}"),
            name: name.to_string(),
            driver: driver.unwrap_or("bridge").to_string(),
            containers: Vec::new(),
        };
        state.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        let network = state
            .networks
            .get(name)
            .ok_or_else(|| RuntimeError::not_found(format!("network {name}")))?;
        if !network.containers.is_empty() {
            return Err(RuntimeError::InUse {
                what: format!("network {name}"),
            });
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::not_found(format!("network {network}")));
        }
        let c = state.container_mut(container)?;
        if c.summary.networks.iter().any(|n| n == network) {
            return Err(RuntimeError::AlreadyExists {
                what: format!("endpoint {container} on {network}"),
            });
        }
        c.summary.networks.push(network.to_string());
        let id = c.summary.id.clone();
        if let Some(n) = state.networks.get_mut(network) {
            n.containers.push(id);
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.check_available()?;
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::not_found(format!("network {network}")));
        }
        let c = state.container_mut(container)?;
        let before = c.summary.networks.len();
        c.summary.networks.retain(|n| n != network);
        if c.summary.networks.len() == before {
            return Err(RuntimeError::not_found(format!(
                "endpoint {container} on {network}"
            )));
        }
        let id = c.summary.id.clone();
        if let Some(n) = state.networks.get_mut(network) {
            n.containers.retain(|member| member != &id);
        }
        Ok(())
    }

    fn logs(&self, id: &str, follow: bool, tail: Option<usize>) -> LogStream {
        let snapshot = {
            let state = self.lock();
            state.check_available().and_then(|_| {
                state.container(id).map(|c| {
                    let skip = tail.map_or(0, |n| c.lines.len().saturating_sub(n));
                    let backlog: Vec<String> = c.lines[skip..].to_vec();
                    let live = (follow && c.summary.status.is_alive())
                        .then(|| c.log_tx.subscribe());
                    (backlog, live)
                })
            })
        };

        Box::pin(async_stream::stream! {
            let (backlog, live) = match snapshot {
                Ok(s) => s,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for line in backlog {
                yield Ok(Bytes::from(format!("{line}\n")));
            }
            let Some(mut rx) = live else {
                return;
            };
            loop {
                match rx.recv().await {
                    Ok(LogSignal::Line(line)) => yield Ok(Bytes::from(format!("{line}\n"))),
                    Ok(LogSignal::Stopped) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
    }
}
