//! The narrow chat-generation interface.
//!
//! A backend turns a [`ChatRequest`] into a stream of raw SSE payloads (the
//! text after `data: `, excluding the terminal `[DONE]`). The production
//! adapter speaks HTTP to a model container; [`ScriptedBackend`] replays a
//! fixed script for tests.

use crate::error::{ErrorKind, StudioError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Stream of raw upstream payloads, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    pub sampling: Sampling,
}

/// Errors from a chat backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{stage} timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl From<LlmError> for StudioError {
    fn from(e: LlmError) -> Self {
        let kind = match &e {
            LlmError::Connection { .. } | LlmError::Http { .. } | LlmError::Streaming { .. } => {
                ErrorKind::Upstream
            }
            LlmError::Timeout { .. } => ErrorKind::Timeout,
            LlmError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
        };
        StudioError::new(kind, e.to_string())
    }
}

/// Something that can generate a chat completion as a stream.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a generation. Errors before the first byte are returned here;
    /// later failures arrive as stream items.
    async fn generate(&self, request: ChatRequest) -> Result<ChunkStream, LlmError>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}

/// Build an OpenAI-style streaming chunk payload.
pub fn completion_chunk(content: &str, usage: Option<(u64, u64)>) -> String {
    let mut chunk = serde_json::json!({
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}}],
    });
    if let Some((prompt, completion)) = usage {
        chunk["usage"] = serde_json::json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        });
    }
    chunk.to_string()
}

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    /// Delay before this step, measured from the previous one.
    pub delay: Duration,
    pub item: Result<String, LlmError>,
}

/// Test backend that replays a fixed script.
///
/// Every call to `generate` replays the same script. Requests are recorded so
/// tests can assert on what was sent. With [`ScriptedBackend::hang_after`] the
/// stream stays open after the script ends; [`ScriptedBackend::was_cancelled`]
/// reports whether a consumer dropped the stream before it completed.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    steps: Vec<ScriptStep>,
    hang: bool,
    fail_start: Option<LlmError>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// A backend that streams `text` word by word with running usage counts.
    pub fn reply(text: &str, prompt_tokens: u64) -> Self {
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        let steps = words
            .iter()
            .enumerate()
            .map(|(i, word)| ScriptStep {
                delay: Duration::ZERO,
                item: Ok(completion_chunk(word, Some((prompt_tokens, i as u64 + 1)))),
            })
            .collect();
        Self::new(steps)
    }

    /// A backend whose `generate` call fails immediately.
    pub fn failing(error: LlmError) -> Self {
        Self {
            fail_start: Some(error),
            ..Default::default()
        }
    }

    /// Keep the stream open after the last step.
    pub fn hang_after(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Whether a stream was dropped before it finished.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Flags cancellation unless disarmed.
struct CancelFlag {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelFlag {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn generate(&self, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(e) = &self.fail_start {
            return Err(e.clone());
        }

        let steps = self.steps.clone();
        let hang = self.hang;
        let mut guard = CancelFlag {
            flag: self.cancelled.clone(),
            armed: true,
        };
        let stream = async_stream::stream! {
            for step in steps {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                yield step.item;
            }
            if hang {
                futures::future::pending::<()>().await;
            }
            guard.armed = false;
        };
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
