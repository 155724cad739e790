//! Reading OpenAI-style streaming chunks.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use studio_core::llm::{ChunkStream, LlmError};
use tracing::warn;

/// Token accounting carried by a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// The parts of a chunk the proxy cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    pub content: Option<String>,
    pub usage: Option<Usage>,
}

/// Parse one raw payload. Fails only when the payload is not a JSON object.
pub fn parse_chunk(payload: &str) -> Result<ParsedChunk, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;
    if !value.is_object() {
        return Err(serde::de::Error::custom("chunk is not a JSON object"));
    }

    let usage = match value.get("usage") {
        Some(u) if !u.is_null() => Some(serde_json::from_value::<Usage>(u.clone())?),
        _ => None,
    };

    let choice = value.get("choices").and_then(|c| c.get(0));
    let content = choice
        .and_then(|c| {
            c.get("delta")
                .and_then(|d| d.get("content"))
                .or_else(|| c.get("text"))
        })
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ParsedChunk { content, usage })
}

/// Drain a stream into its concatenated text content.
///
/// Malformed chunks are skipped; a stream error or `idle` without a chunk
/// aborts collection.
pub async fn collect_text(mut stream: ChunkStream, idle: Duration) -> Result<String, LlmError> {
    let mut text = String::new();
    loop {
        let next = tokio::time::timeout(idle, stream.next())
            .await
            .map_err(|_| LlmError::Timeout {
                stage: "waiting for next upstream chunk".into(),
                timeout_secs: idle.as_secs(),
            })?;
        let Some(item) = next else { break };
        let payload = item?;
        match parse_chunk(&payload) {
            Ok(chunk) => {
                if let Some(content) = chunk.content {
                    text.push_str(&content);
                }
            }
            Err(e) => warn!(error = %e, "Skipping malformed chunk"),
        }
    }
    Ok(text)
}
