//! # Studio Inference
//!
//! The streaming inference proxy. A chat request names a deployment; the
//! proxy resolves it to the container's chat route, forwards the request with
//! sampling and usage options it controls, and relays the SSE response frame
//! by frame while timing token arrivals. One synthetic metrics frame precedes
//! the terminal `[DONE]`.

pub mod api;
pub mod backend;
pub mod chunk;
pub mod metrics;
pub mod proxy;
pub mod service;

pub use backend::{HttpChatBackend, http_client};
pub use chunk::{ParsedChunk, Usage, collect_text, parse_chunk};
pub use metrics::{MetricsTracker, StreamMetrics};
pub use proxy::{ProxySettings, error_frame, proxy_stream};
pub use service::{
    BackendFactory, EndpointResolver, HttpBackendFactory, InferenceRequest, InferenceService,
    SamplingPolicy, upstream_url,
};
