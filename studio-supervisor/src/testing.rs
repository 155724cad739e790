//! In-process CCS for unit tests.

use crate::client::{ContainerControl, SERVICE_NAME};
use crate::models::ModelCatalog;
use crate::ports::PortAllocator;
use crate::store::DeploymentStore;
use crate::supervisor::{DeploySettings, Supervisor};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studio_ccs::{ContainerService, InMemoryRuntime};
use studio_core::config::CcsConfig;
use studio_core::error::StudioError;
use studio_core::types::{
    ContainerDetail, ContainerSummary, NetworkSummary, RunContainerResult, RunContainerSpec,
};

/// `ContainerControl` that calls a `ContainerService` directly.
#[derive(Clone)]
pub(crate) struct LocalCcs {
    pub runtime: InMemoryRuntime,
    pub service: ContainerService,
}

impl LocalCcs {
    pub fn new() -> Self {
        Self::with_runtime(InMemoryRuntime::new().with_network("tt_studio_network"))
    }

    /// No model network yet.
    pub fn bare() -> Self {
        Self::with_runtime(InMemoryRuntime::new())
    }

    fn with_runtime(runtime: InMemoryRuntime) -> Self {
        let service = ContainerService::new(Arc::new(runtime.clone()), &CcsConfig::default());
        Self { runtime, service }
    }
}

#[async_trait]
impl ContainerControl for LocalCcs {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, StudioError> {
        self.service.list_containers(all).await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerDetail, StudioError> {
        self.service.get_container(id).await
    }

    async fn run_container(
        &self,
        spec: &RunContainerSpec,
    ) -> Result<RunContainerResult, StudioError> {
        self.service.run_container(spec.clone(), SERVICE_NAME).await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), StudioError> {
        self.service
            .stop_container(id, Some(grace), SERVICE_NAME)
            .await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), StudioError> {
        self.service.remove_container(id, force, SERVICE_NAME).await
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, StudioError> {
        self.service.list_networks().await
    }

    async fn create_network(&self, name: &str) -> Result<NetworkSummary, StudioError> {
        self.service.create_network(name, None).await
    }
}

pub(crate) fn settings() -> DeploySettings {
    DeploySettings {
        network: "tt_studio_network".to_string(),
        cache_root: PathBuf::from("/var/lib/tt-studio/cache"),
        weights_root: PathBuf::from("/var/lib/tt-studio/weights"),
        backend_jwt_secret: "backend-secret".to_string(),
        stop_grace: Duration::from_secs(1),
        starting_grace: Duration::from_secs(1800),
    }
}

pub(crate) fn supervisor_with(ccs: &LocalCcs, range: RangeInclusive<u16>) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        DeploymentStore::open_in_memory().expect("in-memory store"),
        Arc::new(ccs.clone()),
        Arc::new(PortAllocator::new(range, false)),
        ModelCatalog::default(),
        settings(),
    ))
}
