//! HTTP adapter for model containers speaking the OpenAI chat API.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use studio_core::config::InferenceConfig;
use studio_core::llm::{ChatBackend, ChatRequest, ChunkStream, LlmError};
use studio_core::sse::{DONE, SseDecoder, SseEvent};
use tracing::debug;

/// Shared HTTP client for upstream calls.
///
/// Only the connect phase is bounded here; first-byte and idle bounds are
/// applied per request because a healthy stream may run for minutes.
pub fn http_client(config: &InferenceConfig) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| LlmError::InvalidRequest {
            message: format!("Failed to build HTTP client: {e}"),
        })
}

/// Streams chat completions from one model container.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    first_byte_timeout: Duration,
}

impl HttpChatBackend {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        token: Option<String>,
        first_byte_timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            token,
            first_byte_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Body sent upstream. Streaming and per-chunk usage are always on so the
    /// proxy can account tokens.
    fn request_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.sampling.temperature,
            "top_k": request.sampling.top_k,
            "top_p": request.sampling.top_p,
            "max_tokens": request.sampling.max_tokens,
            "stream": true,
            "stream_options": {
                "include_usage": true,
                "continuous_usage_stats": true,
            },
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                stage: "upstream request".into(),
                timeout_secs: self.first_byte_timeout.as_secs(),
            }
        } else if e.is_connect() {
            LlmError::Connection {
                target: self.url.clone(),
                message: e.to_string(),
            }
        } else {
            LlmError::Streaming {
                message: format!("Request failed: {e}"),
            }
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn generate(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let body = Self::request_body(&request);
        let mut builder = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        debug!(url = %self.url, model = %request.model, "Dispatching upstream request");
        let response = tokio::time::timeout(self.first_byte_timeout, builder.send())
            .await
            .map_err(|_| LlmError::Timeout {
                stage: "waiting for upstream response".into(),
                timeout_secs: self.first_byte_timeout.as_secs(),
            })?
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(LlmError::Streaming { message: e.to_string() });
                        return;
                    }
                };
                for event in decoder.push(&chunk) {
                    if let SseEvent::Data(payload) = event {
                        if payload.trim() == DONE {
                            return;
                        }
                        yield Ok(payload);
                    }
                }
            }
            if let Some(SseEvent::Data(payload)) = decoder.finish()
                && payload.trim() != DONE
            {
                yield Ok(payload);
            }
        };
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "http"
    }
}
