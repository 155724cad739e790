//! Request shaping: deploy id to endpoint, endpoint to backend, client
//! fields to upstream sampling.

use crate::backend::{HttpChatBackend, http_client};
use crate::chunk::collect_text;
use crate::proxy::{ProxySettings, proxy_stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use studio_core::auth::{DEFAULT_TOKEN_TTL, ServiceAuth};
use studio_core::config::{InferenceConfig, UpstreamAddressing};
use studio_core::error::StudioError;
use studio_core::llm::{ChatBackend, ChatMessage, ChatRequest, Sampling};
use studio_supervisor::{ModelEndpoint, Supervisor};
use tracing::info;

/// Service name carried in tokens presented to model containers.
pub const BACKEND_SERVICE: &str = "tt-studio-backend";

/// Body of `POST /api/v1/inference/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferenceRequest {
    pub deploy_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Single-turn shorthand for `messages`.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl InferenceRequest {
    /// The conversation to send, built from `messages` or `text`.
    pub fn conversation(&self) -> Result<Vec<ChatMessage>, StudioError> {
        let mut messages = if !self.messages.is_empty() {
            self.messages.clone()
        } else if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            vec![ChatMessage::user(text)]
        } else {
            return Err(StudioError::invalid_request(
                "request needs either messages or text",
            ));
        };
        if let Some(system) = self.system_prompt.as_deref()
            && messages.first().is_none_or(|m| m.role != "system")
        {
            messages.insert(0, ChatMessage::system(system));
        }
        Ok(messages)
    }
}

/// Decides which sampling parameters reach the model.
#[derive(Debug, Clone, Copy)]
pub struct SamplingPolicy {
    pub defaults: Sampling,
    pub allow_client_overrides: bool,
}

impl SamplingPolicy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            defaults: Sampling {
                temperature: config.default_temperature,
                top_k: config.default_top_k,
                top_p: config.default_top_p,
                max_tokens: config.default_max_tokens,
            },
            allow_client_overrides: config.allow_client_overrides,
        }
    }

    pub fn apply(&self, request: &InferenceRequest) -> Sampling {
        if !self.allow_client_overrides {
            return self.defaults;
        }
        Sampling {
            temperature: request.temperature.unwrap_or(self.defaults.temperature),
            top_k: request.top_k.unwrap_or(self.defaults.top_k),
            top_p: request.top_p.unwrap_or(self.defaults.top_p),
            max_tokens: request.max_tokens.unwrap_or(self.defaults.max_tokens),
        }
    }
}

/// Maps a deployment to where it serves.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, deploy_id: &str) -> Result<ModelEndpoint, StudioError>;
}

#[async_trait]
impl EndpointResolver for Supervisor {
    async fn resolve(&self, deploy_id: &str) -> Result<ModelEndpoint, StudioError> {
        self.endpoint(deploy_id).await
    }
}

/// Builds a chat backend for a resolved endpoint.
pub trait BackendFactory: Send + Sync {
    fn backend(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn ChatBackend>, StudioError>;
}

/// URL of the chat route of a deployment.
pub fn upstream_url(
    endpoint: &ModelEndpoint,
    addressing: UpstreamAddressing,
) -> Result<String, StudioError> {
    match addressing {
        UpstreamAddressing::Network => Ok(format!(
            "http://{}:{}{}",
            endpoint.container_name, endpoint.service_port, endpoint.route
        )),
        UpstreamAddressing::Host => {
            let port = endpoint.host_port.ok_or_else(|| {
                StudioError::not_found(format!(
                    "host port of deployment {}",
                    endpoint.deploy_id
                ))
            })?;
            Ok(format!("http://127.0.0.1:{port}{}", endpoint.route))
        }
    }
}

/// Production factory: one [`HttpChatBackend`] per request over a shared
/// client, signed with the backend secret.
#[derive(Debug, Clone)]
pub struct HttpBackendFactory {
    http: reqwest::Client,
    addressing: UpstreamAddressing,
    auth: Option<ServiceAuth>,
    first_byte_timeout: Duration,
}

impl HttpBackendFactory {
    pub fn from_config(config: &InferenceConfig) -> Result<Self, StudioError> {
        let auth = (!config.backend_jwt_secret.is_empty())
            .then(|| ServiceAuth::new(&config.backend_jwt_secret));
        Ok(Self {
            http: http_client(config)?,
            addressing: config.addressing,
            auth,
            first_byte_timeout: Duration::from_secs(config.first_byte_timeout_secs),
        })
    }
}

impl BackendFactory for HttpBackendFactory {
    fn backend(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn ChatBackend>, StudioError> {
        let url = upstream_url(endpoint, self.addressing)?;
        let token = match &self.auth {
            Some(auth) => Some(auth.issue(BACKEND_SERVICE, DEFAULT_TOKEN_TTL)?),
            None => None,
        };
        Ok(Arc::new(HttpChatBackend::new(
            self.http.clone(),
            url,
            token,
            self.first_byte_timeout,
        )))
    }
}

/// Entry point used by the HTTP routes and by grounded answering.
#[derive(Clone)]
pub struct InferenceService {
    resolver: Arc<dyn EndpointResolver>,
    backends: Arc<dyn BackendFactory>,
    policy: SamplingPolicy,
    settings: ProxySettings,
}

impl std::fmt::Debug for InferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceService")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl InferenceService {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        backends: Arc<dyn BackendFactory>,
        policy: SamplingPolicy,
        settings: ProxySettings,
    ) -> Self {
        Self {
            resolver,
            backends,
            policy,
            settings,
        }
    }

    pub fn from_config(
        supervisor: Arc<Supervisor>,
        config: &InferenceConfig,
    ) -> Result<Self, StudioError> {
        Ok(Self::new(
            supervisor,
            Arc::new(HttpBackendFactory::from_config(config)?),
            SamplingPolicy::from_config(config),
            ProxySettings::from_config(config),
        ))
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    async fn prepare(
        &self,
        deploy_id: &str,
        messages: Vec<ChatMessage>,
        sampling: Sampling,
    ) -> Result<(Arc<dyn ChatBackend>, ChatRequest), StudioError> {
        if deploy_id.trim().is_empty() {
            return Err(StudioError::invalid_request("deploy_id is required"));
        }
        let endpoint = self.resolver.resolve(deploy_id).await?;
        let backend = self.backends.backend(&endpoint)?;
        info!(
            deploy_id = %endpoint.deploy_id,
            model_id = %endpoint.model_id,
            max_tokens = sampling.max_tokens,
            "Proxying chat request"
        );
        let request = ChatRequest {
            model: endpoint.served_model,
            messages,
            tools: Vec::new(),
            sampling,
        };
        Ok((backend, request))
    }

    /// Resolve and start a proxied stream. Errors before the first frame are
    /// returned as plain errors so the route can answer with a status code.
    pub async fn stream(
        &self,
        request: InferenceRequest,
    ) -> Result<impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static, StudioError> {
        let messages = request.conversation()?;
        let sampling = self.policy.apply(&request);
        let (backend, chat) = self.prepare(&request.deploy_id, messages, sampling).await?;
        Ok(proxy_stream(backend, chat, self.settings))
    }

    /// Run a generation to completion and return its text.
    pub async fn complete(
        &self,
        deploy_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, StudioError> {
        let (backend, chat) = self.prepare(deploy_id, messages, self.policy.defaults).await?;
        let stream = backend.generate(chat).await?;
        Ok(collect_text(stream, self.settings.idle_timeout).await?)
    }
}
