//! # Studio Supervisor
//!
//! The Deployment Supervisor owns the lifecycle of model containers: it
//! validates deploy requests against the static model catalog, reserves a
//! host port, asks CCS to launch the container and records the outcome in a
//! local SQLite table. A background reconciler keeps `running` records in
//! step with what the runtime actually reports.

pub mod api;
pub mod client;
pub mod models;
pub mod ports;
pub mod reconciler;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use client::{CcsClient, ContainerControl};
pub use models::{DeviceClass, ModelCatalog, ModelDescriptor};
pub use ports::{PortAllocator, PortLease};
pub use reconciler::{Reconciler, SweepReport};
pub use store::{DeploymentRecord, DeploymentStatus, DeploymentStore, StoreError};
pub use supervisor::{DeployRequest, DeploySettings, ModelEndpoint, Supervisor, WeightsSelection};
