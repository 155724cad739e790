//! Container runtime abstraction.
//!
//! The service layer only ever talks to a [`ContainerRuntime`]. The Docker
//! adapter is the production implementation; the in-memory runtime backs the
//! tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;
use studio_core::error::{ErrorKind, StudioError};
use studio_core::types::{
    ContainerDetail, ContainerSummary, NetworkSummary, PullProgress, RunContainerResult,
    RunContainerSpec,
};

/// Raw log output, in arrival order. Chunks need not align with lines.
pub type LogStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Progress records of an image pull.
pub type PullStream = BoxStream<'static, Result<PullProgress, RuntimeError>>;

/// Errors reported by a container runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    AlreadyExists { what: String },

    #[error("container {id} is still running")]
    StillRunning { id: String },

    #[error("{what} is in use")]
    InUse { what: String },

    #[error("runtime rejected the request: {message}")]
    Rejected { message: String },

    #[error("container runtime unavailable: {message}")]
    Unavailable { message: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("runtime error: {message}")]
    Other { message: String },
}

impl RuntimeError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NotFound { .. } => ErrorKind::NotFound,
            RuntimeError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            RuntimeError::StillRunning { .. } => ErrorKind::StillRunning,
            RuntimeError::InUse { .. } => ErrorKind::InUse,
            RuntimeError::Rejected { .. } => ErrorKind::InvalidRequest,
            RuntimeError::Unavailable { .. } => ErrorKind::RuntimeUnavailable,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::Other { .. } => ErrorKind::Internal,
        }
    }
}

impl From<RuntimeError> for StudioError {
    fn from(e: RuntimeError) -> Self {
        StudioError::new(e.kind(), e.to_string())
    }
}

/// Operations the control service needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// Create and start a container. The spec has already passed policy.
    async fn run_container(
        &self,
        spec: &RunContainerSpec,
    ) -> Result<RunContainerResult, RuntimeError>;

    /// Stop a container, killing it after `grace`. Stopping a stopped
    /// container succeeds.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove a container. Without `force` a running container yields
    /// [`RuntimeError::StillRunning`].
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn image_exists(&self, name: &str, tag: &str) -> Result<bool, RuntimeError>;

    async fn remove_image(&self, name: &str, tag: &str, force: bool) -> Result<(), RuntimeError>;

    fn pull_image(&self, name: &str, tag: &str) -> PullStream;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, RuntimeError>;

    async fn create_network(
        &self,
        name: &str,
        driver: Option<&str>,
    ) -> Result<NetworkSummary, RuntimeError>;

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), RuntimeError>;

    /// Container output. With `follow` the stream lasts until the container
    /// stops or the consumer drops it.
    fn logs(&self, id: &str, follow: bool, tail: Option<usize>) -> LogStream;
}
