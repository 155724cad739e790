//! # Studio CCS
//!
//! The Container Control Service: the only TT Studio process allowed to talk
//! to the container runtime. Other components reach it over HTTP with a
//! service JWT and get a narrow, whitelisted API for images, containers and
//! networks, with streamed logs and pull progress.

pub mod docker;
pub mod health;
pub mod logs;
pub mod memory;
pub mod policy;
pub mod runtime;
pub mod server;
pub mod service;

pub use docker::DockerRuntime;
pub use memory::InMemoryRuntime;
pub use policy::LaunchPolicy;
pub use runtime::{ContainerRuntime, RuntimeError};
pub use server::router;
pub use service::ContainerService;
