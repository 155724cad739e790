//! Deploy and stop orchestration.
//!
//! State transitions for one deployment are serialized by a per-record
//! async mutex. The port map has its own short-lived mutex and is never
//! held across a CCS call.

use crate::client::ContainerControl;
use crate::models::{
    CONTAINER_CACHE_ROOT, CONTAINER_WEIGHTS_DIR, ModelCatalog, ModelDescriptor,
};
use crate::ports::PortAllocator;
use crate::store::{DeploymentRecord, DeploymentStatus, DeploymentStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studio_core::config::StudioConfig;
use studio_core::error::{ErrorKind, StudioError};
use studio_core::types::{
    ContainerSummary, LABEL_DEPLOY_ID, LABEL_MANAGED, LABEL_MODEL_ID, RunContainerSpec,
    VolumeBinding,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Knobs the supervisor applies to every deployment.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub network: String,
    pub cache_root: PathBuf,
    pub weights_root: PathBuf,
    /// Secret model containers use to verify inference tokens.
    pub backend_jwt_secret: String,
    pub stop_grace: Duration,
    pub starting_grace: Duration,
}

impl DeploySettings {
    pub fn from_config(config: &StudioConfig) -> Self {
        let s = &config.supervisor;
        Self {
            network: s.network.clone(),
            cache_root: config.storage_path(&s.cache_root),
            weights_root: config.storage_path(&s.weights_root),
            backend_jwt_secret: config.inference.backend_jwt_secret.clone(),
            stop_grace: Duration::from_secs(s.stop_grace_secs),
            starting_grace: Duration::from_secs(s.starting_grace_secs),
        }
    }
}

/// Body of `POST /api/v1/deployments`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub model_id: String,
    #[serde(default)]
    pub weights_id: Option<String>,
    #[serde(default)]
    pub weights_path: Option<String>,
}

/// Which weights a deployment loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSelection {
    Default,
    Custom { id: String, path: PathBuf },
}

impl WeightsSelection {
    /// Both absent selects the default weights, both present a custom set.
    /// Anything else is `weights_mismatch`.
    pub fn resolve(
        weights_id: Option<&str>,
        weights_path: Option<&str>,
        weights_root: &Path,
    ) -> Result<Self, StudioError> {
        let id = weights_id.filter(|s| !s.trim().is_empty());
        let path = weights_path.filter(|s| !s.trim().is_empty());
        match (id, path) {
            (None, None) => Ok(Self::Default),
            (Some(id), Some(path)) => {
                let relative = Path::new(path);
                let escapes = relative
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
                if escapes {
                    return Err(StudioError::invalid_request(format!(
                        "weights path '{path}' must stay inside the weights directory"
                    )));
                }
                Ok(Self::Custom {
                    id: id.to_string(),
                    path: weights_root.join(relative),
                })
            }
            (Some(_), None) | (None, Some(_)) => Err(StudioError::new(
                ErrorKind::WeightsMismatch,
                "weights_id and weights_path must be given together",
            )),
        }
    }

    fn id(&self) -> Option<String> {
        match self {
            Self::Default => None,
            Self::Custom { id, .. } => Some(id.clone()),
        }
    }
}

/// Where an inference request for a deployment should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEndpoint {
    pub deploy_id: String,
    pub model_id: String,
    /// Model name the inference server expects in requests.
    pub served_model: String,
    pub container_name: String,
    pub host_port: Option<u16>,
    pub service_port: u16,
    pub route: String,
}

#[derive(Debug, Default)]
struct RecordLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    fn prune(&self, key: &str) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }
}

/// Owns deployments: the table, the port map and the CCS seam.
pub struct Supervisor {
    store: DeploymentStore,
    ports: Arc<PortAllocator>,
    control: Arc<dyn ContainerControl>,
    catalog: ModelCatalog,
    settings: DeploySettings,
    locks: RecordLocks,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn container_name(model_id: &str, deploy_id: &str) -> String {
    let base: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let short: String = deploy_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{base}_{short}")
}

impl Supervisor {
    pub fn new(
        store: DeploymentStore,
        control: Arc<dyn ContainerControl>,
        ports: Arc<PortAllocator>,
        catalog: ModelCatalog,
        settings: DeploySettings,
    ) -> Self {
        Self {
            store,
            ports,
            control,
            catalog,
            settings,
            locks: RecordLocks::default(),
        }
    }

    pub fn store(&self) -> &DeploymentStore {
        &self.store
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn control(&self) -> &Arc<dyn ContainerControl> {
        &self.control
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// Rebuild the port map from records that may hold a port.
    pub async fn hydrate(&self) -> Result<usize, StudioError> {
        let mut restored = 0;
        for record in self.store.list(None).await? {
            if !record.status.holds_port() {
                continue;
            }
            if let Some(port) = record.port
                && self.ports.reserve(port, &record.deploy_id)
            {
                restored += 1;
            }
        }
        info!(restored, "Port reservations hydrated");
        Ok(restored)
    }

    /// Create the model network if CCS does not know it yet.
    pub async fn ensure_network(&self) -> Result<(), StudioError> {
        let networks = self.control.list_networks().await?;
        if networks.iter().any(|n| n.name == self.settings.network) {
            return Ok(());
        }
        match self.control.create_network(&self.settings.network).await {
            Ok(_) => {
                info!(network = %self.settings.network, "Created model network");
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn run_spec(
        &self,
        model: &ModelDescriptor,
        deploy_id: &str,
        name: &str,
        port: u16,
        weights: &WeightsSelection,
    ) -> RunContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("JWT_SECRET".to_string(), self.settings.backend_jwt_secret.clone());
        env.insert("CACHE_ROOT".to_string(), CONTAINER_CACHE_ROOT.to_string());
        env.insert("SERVICE_PORT".to_string(), model.service_port.to_string());
        env.insert("TT_STUDIO_DEPLOY_ID".to_string(), deploy_id.to_string());
        if !model.hf_model_id.is_empty() {
            env.insert("HF_MODEL_REPO_ID".to_string(), model.hf_model_id.to_string());
        }
        if let Some(mesh) = model.device.mesh_device() {
            env.insert("MESH_DEVICE".to_string(), mesh.to_string());
        }

        let mut volumes = vec![VolumeBinding {
            host: self
                .settings
                .cache_root
                .join(model.id)
                .to_string_lossy()
                .into_owned(),
            container: CONTAINER_CACHE_ROOT.to_string(),
            read_only: false,
        }];
        volumes.extend(model.volumes.iter().map(|v| VolumeBinding {
            host: v.host.to_string(),
            container: v.container.to_string(),
            read_only: v.read_only,
        }));
        if let WeightsSelection::Custom { path, .. } = weights {
            volumes.push(VolumeBinding {
                host: path.to_string_lossy().into_owned(),
                container: CONTAINER_WEIGHTS_DIR.to_string(),
                read_only: true,
            });
            env.insert(
                "MODEL_WEIGHTS_PATH".to_string(),
                CONTAINER_WEIGHTS_DIR.to_string(),
            );
        }

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_DEPLOY_ID.to_string(), deploy_id.to_string());
        labels.insert(LABEL_MODEL_ID.to_string(), model.id.to_string());

        let mut ports = BTreeMap::new();
        ports.insert(model.port_key(), port);

        RunContainerSpec {
            image: model.image.to_string(),
            name: Some(name.to_string()),
            env,
            ports,
            network: Some(self.settings.network.clone()),
            volumes,
            devices: model.device.devices().iter().map(|d| d.to_string()).collect(),
            shm_size: Some(model.shm_size),
            labels,
            ..Default::default()
        }
    }

    /// Launch a model and return its record.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeploymentRecord, StudioError> {
        let model = self.catalog.require(&request.model_id)?;
        let weights = WeightsSelection::resolve(
            request.weights_id.as_deref(),
            request.weights_path.as_deref(),
            &self.settings.weights_root,
        )?;

        let deploy_id = Uuid::new_v4().to_string();
        let lock = self.locks.get(&deploy_id);
        let _guard = lock.lock().await;

        let lease = self.ports.lease(&deploy_id)?;
        let port = lease.port();
        let name = container_name(model.id, &deploy_id);
        let mut record =
            DeploymentRecord::starting(&deploy_id, &name, model.id, model.device.as_str(), port);
        record.weights_id = weights.id();
        self.store.insert(&record).await?;
        info!(deploy_id = %deploy_id, model = model.id, port, "Deployment starting");

        let spec = self.run_spec(model, &deploy_id, &name, port, &weights);
        match self.control.run_container(&spec).await {
            Ok(started) => {
                // The container holds the port from here on, even if this
                // future is dropped while the record is being updated.
                lease.commit();
                if let Err(store_err) = self
                    .store
                    .mark_running(&deploy_id, &started.id, &started.name, Some(port))
                    .await
                {
                    return Err(self
                        .abandon_launch(&deploy_id, &started.id, port, store_err.into())
                        .await);
                }
                info!(
                    deploy_id = %deploy_id,
                    container = %started.id,
                    port,
                    "Deployment running"
                );
                record.container_id = Some(started.id);
                record.container_name = started.name;
                record.status = DeploymentStatus::Running;
                Ok(record)
            }
            Err(e) => {
                drop(lease);
                warn!(deploy_id = %deploy_id, kind = %e.kind, error = %e.message, "Deployment failed");
                if let Err(store_err) = self.store.mark_error(&deploy_id, &e.to_string()).await {
                    warn!(deploy_id = %deploy_id, error = %store_err, "Failed to record deploy error");
                }
                Err(e)
            }
        }
    }

    /// Undo a launch whose record could not be updated: stop the container,
    /// free its port and mark the record failed where possible.
    async fn abandon_launch(
        &self,
        deploy_id: &str,
        container: &str,
        port: u16,
        cause: StudioError,
    ) -> StudioError {
        error!(deploy_id = %deploy_id, container = %container, error = %cause, "Launched container could not be recorded");
        if let Err(e) = self.stop_container(container).await {
            warn!(deploy_id = %deploy_id, container = %container, error = %e, "Failed to stop unrecorded container");
            return cause;
        }
        self.ports.release(port, deploy_id);
        if let Err(e) = self.store.mark_error(deploy_id, &cause.to_string()).await {
            warn!(deploy_id = %deploy_id, error = %e, "Failed to record deploy error");
        }
        cause
    }

    /// Stop and remove a deployment's container. Idempotent.
    pub async fn stop(&self, key: &str) -> Result<DeploymentRecord, StudioError> {
        let found = self.get(key).await?;
        let deploy_id = found.deploy_id.clone();
        let lock = self.locks.get(&deploy_id);
        let guard = lock.lock().await;

        let record = self.get(&deploy_id).await?;
        if record.status == DeploymentStatus::Stopped {
            debug!(deploy_id = %deploy_id, "Already stopped");
            return Ok(record);
        }

        self.store.mark_stopped_by_user(&deploy_id).await?;
        if let Some(container) = record.container_id.as_deref() {
            self.stop_container(container).await?;
        }
        self.store.mark_stopped(&deploy_id).await?;
        if let Some(port) = record.port {
            self.ports.release(port, &deploy_id);
        }
        info!(deploy_id = %deploy_id, "Deployment stopped by user");

        let stopped = self.get(&deploy_id).await?;
        drop(guard);
        drop(lock);
        self.locks.prune(&deploy_id);
        Ok(stopped)
    }

    async fn stop_container(&self, container: &str) -> Result<(), StudioError> {
        match self
            .control
            .stop_container(container, self.settings.stop_grace)
            .await
        {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.control.remove_container(container, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind == ErrorKind::StillRunning => {
                match self.control.remove_container(container, true).await {
                    Err(e) if e.kind != ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a record by deploy id or container id.
    pub async fn get(&self, key: &str) -> Result<DeploymentRecord, StudioError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| StudioError::not_found(format!("deployment {key}")))
    }

    pub async fn list(
        &self,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<DeploymentRecord>, StudioError> {
        Ok(self.store.list(status).await?)
    }

    /// Resolve a running deployment to its serving endpoint.
    pub async fn endpoint(&self, key: &str) -> Result<ModelEndpoint, StudioError> {
        let record = self.get(key).await?;
        if record.status != DeploymentStatus::Running {
            return Err(StudioError::not_found(format!(
                "running deployment {key} (status is {})",
                record.status
            )));
        }
        let (served_model, service_port, route) = match self.catalog.get(&record.model_id) {
            Some(model) if !model.hf_model_id.is_empty() => (
                model.hf_model_id.to_string(),
                model.service_port,
                model.route.to_string(),
            ),
            Some(model) => (
                model.id.to_string(),
                model.service_port,
                model.route.to_string(),
            ),
            None => (
                record.model_id.clone(),
                7000,
                "/v1/chat/completions".to_string(),
            ),
        };
        Ok(ModelEndpoint {
            deploy_id: record.deploy_id,
            model_id: record.model_id,
            served_model,
            container_name: record.container_name,
            host_port: record.port,
            service_port,
            route,
        })
    }

    /// Move a vanished or dead container's record out of `running`.
    ///
    /// Skips records another transition currently holds.
    pub(crate) async fn record_lost(
        &self,
        record: &DeploymentRecord,
        status: DeploymentStatus,
    ) -> Result<bool, StudioError> {
        let lock = self.locks.get(&record.deploy_id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(deploy_id = %record.deploy_id, "Record busy; skipping this sweep");
            return Ok(false);
        };
        let changed = self.store.mark_lost(&record.deploy_id, status).await?;
        if changed {
            if let Some(port) = record.port {
                self.ports.release(port, &record.deploy_id);
            }
            warn!(
                deploy_id = %record.deploy_id,
                container = record.container_id.as_deref().unwrap_or("-"),
                status = %status,
                "Deployment lost its container"
            );
        }
        Ok(changed)
    }

    /// Give a running managed container without a live record one.
    pub(crate) async fn adopt(
        &self,
        container: &ContainerSummary,
    ) -> Result<Option<DeploymentRecord>, StudioError> {
        let existing = match self.store.get(&container.id).await? {
            Some(r) => Some(r),
            None => match container.labels.get(LABEL_DEPLOY_ID) {
                Some(id) => self.store.get(id).await?,
                None => None,
            },
        };
        let deploy_id = existing
            .as_ref()
            .map(|r| r.deploy_id.clone())
            .or_else(|| container.labels.get(LABEL_DEPLOY_ID).cloned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let lock = self.locks.get(&deploy_id);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(None);
        };

        if let Some(record) = &existing {
            if record.status == DeploymentStatus::Running {
                return Ok(None);
            }
            if record.stopped_by_user || record.status == DeploymentStatus::Stopped {
                warn!(
                    deploy_id = %deploy_id,
                    container = %container.id,
                    "Container of a stopped deployment is still running"
                );
                return Ok(None);
            }
        }

        let port = container
            .host_port()
            .filter(|p| self.ports.reserve(*p, &deploy_id));

        let adopted = match existing {
            Some(_) => {
                let revived = self
                    .store
                    .mark_running(&deploy_id, &container.id, &container.name, port)
                    .await?;
                if !revived {
                    if let Some(p) = port {
                        self.ports.release(p, &deploy_id);
                    }
                    return Ok(None);
                }
                self.get(&deploy_id).await?
            }
            None => {
                let model_id = container
                    .labels
                    .get(LABEL_MODEL_ID)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                let device = self
                    .catalog
                    .get(&model_id)
                    .map(|m| m.device.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let mut record =
                    DeploymentRecord::starting(&deploy_id, &container.name, model_id, device, 0);
                record.port = port;
                record.container_id = Some(container.id.clone());
                record.status = DeploymentStatus::Running;
                if let Err(e) = self.store.insert(&record).await {
                    if let Some(p) = port {
                        self.ports.release(p, &deploy_id);
                    }
                    return Err(e.into());
                }
                record
            }
        };
        info!(
            deploy_id = %adopted.deploy_id,
            container = %container.id,
            port = ?adopted.port,
            "Adopted running container"
        );
        Ok(Some(adopted))
    }

    /// Fail a record that never got a container.
    pub(crate) async fn expire_starting(
        &self,
        record: &DeploymentRecord,
    ) -> Result<bool, StudioError> {
        let lock = self.locks.get(&record.deploy_id);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(false);
        };
        let message = format!(
            "deployment did not start within {}s",
            self.settings.starting_grace.as_secs()
        );
        let changed = self.store.mark_error(&record.deploy_id, &message).await?;
        if changed {
            if let Some(port) = record.port {
                self.ports.release(port, &record.deploy_id);
            }
            warn!(deploy_id = %record.deploy_id, "Stale deployment marked as error");
        }
        Ok(changed)
    }
}
