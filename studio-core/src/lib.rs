//! # Studio Core
//!
//! Shared plumbing for the TT Studio control plane.
//! Provides the cross-service error vocabulary, layered configuration,
//! service-to-service JWT auth, SSE framing, container wire types and the
//! narrow chat-backend interface.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod sse;
pub mod types;

// Re-export commonly used types at the crate root.
pub use auth::{AuthError, DEFAULT_TOKEN_TTL, ServiceAuth, ServiceClaims};
pub use config::{
    CcsConfig, ConfigError, InferenceConfig, LoggingConfig, RagConfig, StudioConfig,
    SupervisorConfig, UpstreamAddressing, VectorBackend, load_config,
};
pub use error::{ErrorBody, ErrorKind, Result, StudioError};
pub use llm::{
    ChatBackend, ChatMessage, ChatRequest, ChunkStream, LlmError, Sampling, ScriptStep,
    ScriptedBackend,
};
pub use types::{
    ContainerDetail, ContainerStatus, ContainerSummary, HealthCheck, HealthReport, HealthStatus,
    RunContainerResult, RunContainerSpec,
};
