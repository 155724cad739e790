//! The control service: policy plus a runtime, with a deadline on every call.

use crate::health;
use crate::logs::log_event_stream;
use crate::policy::LaunchPolicy;
use crate::runtime::{ContainerRuntime, RuntimeError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studio_core::config::CcsConfig;
use studio_core::error::StudioError;
use studio_core::sse;
use studio_core::types::{
    ContainerDetail, ContainerSummary, HealthReport, NetworkSummary, RunContainerResult,
    RunContainerSpec,
};
use tracing::{info, warn};

/// Grace period used when a stop request does not name one.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Container operations as exposed over HTTP.
#[derive(Clone)]
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
    policy: LaunchPolicy,
    call_timeout: Duration,
    disk_path: PathBuf,
    disk_free_warn_percent: f64,
    log_retry_ms: u64,
}

impl std::fmt::Debug for ContainerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerService")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ContainerService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &CcsConfig) -> Self {
        Self {
            runtime,
            policy: LaunchPolicy::from_config(config),
            call_timeout: Duration::from_secs(config.runtime_timeout_secs),
            disk_path: config.disk_path.clone(),
            disk_free_warn_percent: config.disk_free_warn_percent,
            log_retry_ms: config.log_retry_ms,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        limit: Duration,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, StudioError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(StudioError::from),
            Err(_) => {
                warn!(operation, timeout_secs = limit.as_secs(), "Runtime call timed out");
                Err(StudioError::timeout(operation, limit))
            }
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, StudioError> {
        self.bounded(
            "list containers",
            self.call_timeout,
            self.runtime.list_containers(all),
        )
        .await
    }

    pub async fn get_container(&self, id: &str) -> Result<ContainerDetail, StudioError> {
        self.bounded(
            "inspect container",
            self.call_timeout,
            self.runtime.inspect_container(id),
        )
        .await
    }

    /// Admit the spec through policy, then launch it.
    pub async fn run_container(
        &self,
        mut spec: RunContainerSpec,
        caller: &str,
    ) -> Result<RunContainerResult, StudioError> {
        if let Err(e) = self.policy.admit(&mut spec) {
            warn!(caller, image = %spec.image, kind = %e.kind, "Run request rejected by policy");
            return Err(e);
        }
        let result = self
            .bounded(
                "run container",
                self.call_timeout,
                self.runtime.run_container(&spec),
            )
            .await?;
        info!(
            caller,
            container_id = %result.id,
            name = %result.name,
            image = %spec.image,
            "Container started"
        );
        Ok(result)
    }

    pub async fn stop_container(
        &self,
        id: &str,
        grace: Option<Duration>,
        caller: &str,
    ) -> Result<(), StudioError> {
        let grace = grace.unwrap_or(DEFAULT_STOP_GRACE);
        self.bounded(
            "stop container",
            grace + self.call_timeout,
            self.runtime.stop_container(id, grace),
        )
        .await?;
        info!(caller, container_id = id, "Container stopped");
        Ok(())
    }

    pub async fn remove_container(
        &self,
        id: &str,
        force: bool,
        caller: &str,
    ) -> Result<(), StudioError> {
        self.bounded(
            "remove container",
            self.call_timeout,
            self.runtime.remove_container(id, force),
        )
        .await?;
        info!(caller, container_id = id, force, "Container removed");
        Ok(())
    }

    pub async fn image_exists(&self, name: &str, tag: &str) -> Result<bool, StudioError> {
        self.bounded(
            "inspect image",
            self.call_timeout,
            self.runtime.image_exists(name, tag),
        )
        .await
    }

    /// Only trusted images may be removed through the service.
    pub async fn remove_image(
        &self,
        name: &str,
        tag: &str,
        force: bool,
        caller: &str,
    ) -> Result<(), StudioError> {
        self.policy.check_image(name)?;
        self.bounded(
            "remove image",
            self.call_timeout,
            self.runtime.remove_image(name, tag, force),
        )
        .await?;
        info!(caller, image = name, tag, "Image removed");
        Ok(())
    }

    /// Pull a trusted image, as SSE progress frames.
    pub fn pull_image(
        &self,
        name: &str,
        tag: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static, StudioError> {
        self.policy.check_image(name)?;
        let mut upstream = self.runtime.pull_image(name, tag);
        let retry_ms = self.log_retry_ms;
        let reference = format!("{name}:{tag}");
        info!(image = %reference, "Image pull started");
        Ok(async_stream::stream! {
            yield Ok(sse::retry_frame(retry_ms));
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(progress) => yield Ok(sse::json_frame(&serde_json::json!({
                        "type": "progress",
                        "status": progress.status,
                        "progress": progress.progress,
                        "id": progress.id,
                    }))),
                    Err(e) => {
                        warn!(image = %reference, error = %e, "Image pull failed");
                        yield Ok(sse::json_frame(&serde_json::json!({
                            "type": "error",
                            "error_kind": e.kind(),
                            "message": e.to_string(),
                        })));
                        return;
                    }
                }
            }
            info!(image = %reference, "Image pull finished");
            yield Ok(sse::json_frame(&serde_json::json!({"type": "done", "image": reference})));
            yield Ok(sse::done_frame());
        })
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>, StudioError> {
        self.bounded("list networks", self.call_timeout, self.runtime.list_networks())
            .await
    }

    pub async fn create_network(
        &self,
        name: &str,
        driver: Option<&str>,
    ) -> Result<NetworkSummary, StudioError> {
        self.policy.check_network(name)?;
        let network = self
            .bounded(
                "create network",
                self.call_timeout,
                self.runtime.create_network(name, driver),
            )
            .await?;
        info!(network = name, "Network created");
        Ok(network)
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), StudioError> {
        self.policy.check_network(name)?;
        self.bounded(
            "remove network",
            self.call_timeout,
            self.runtime.remove_network(name),
        )
        .await?;
        info!(network = name, "Network removed");
        Ok(())
    }

    pub async fn connect_network(&self, network: &str, container: &str) -> Result<(), StudioError> {
        self.policy.check_network(network)?;
        self.bounded(
            "connect network",
            self.call_timeout,
            self.runtime.connect_network(network, container),
        )
        .await
    }

    pub async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), StudioError> {
        self.policy.check_network(network)?;
        self.bounded(
            "disconnect network",
            self.call_timeout,
            self.runtime.disconnect_network(network, container, force),
        )
        .await
    }

    /// Stream a container's logs as SSE frames. Fails `not_found` up front
    /// when the container does not exist.
    pub async fn stream_logs(
        &self,
        id: &str,
        follow: bool,
        tail: Option<usize>,
    ) -> Result<impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static, StudioError> {
        let detail = self.get_container(id).await?;
        Ok(log_event_stream(
            self.runtime.clone(),
            detail.summary.id,
            follow,
            tail,
            self.log_retry_ms,
        ))
    }

    pub async fn health(&self) -> HealthReport {
        health::probe(
            self.runtime.as_ref(),
            &self.disk_path,
            self.disk_free_warn_percent,
        )
        .await
    }

    /// Whether the runtime answers a ping right now.
    pub async fn ready(&self) -> bool {
        matches!(
            tokio::time::timeout(health::PING_TIMEOUT, self.runtime.ping()).await,
            Ok(Ok(()))
        )
    }
}
