//! Container log streaming.
//!
//! Runtime output is split into lines, each line is classified by keyword and
//! sent as one SSE frame. The stream opens with a retry hint and ends with
//! `[DONE]`, or with a single `error` frame when the container disappears.

use crate::runtime::{ContainerRuntime, RuntimeError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use studio_core::sse;
use tracing::debug;

/// Category of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Error,
    Warning,
    Event,
    Log,
}

const ERROR_KEYWORDS: &[&str] = &["ERROR", "EXCEPTION", "FAILED", "FATAL"];
const WARNING_KEYWORDS: &[&str] = &["WARNING", "WARN"];
const EVENT_KEYWORDS: &[&str] = &["INFO", "STARTED", "LISTENING", "READY"];

/// Classify a line by case-insensitive keyword scan. Errors win over
/// warnings, warnings over events.
pub fn classify(line: &str) -> LogKind {
    let upper = line.to_ascii_uppercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| upper.contains(k));
    if has(ERROR_KEYWORDS) {
        LogKind::Error
    } else if has(WARNING_KEYWORDS) {
        LogKind::Warning
    } else if has(EVENT_KEYWORDS) {
        LogKind::Event
    } else {
        LogKind::Log
    }
}

/// One `data:` payload of the log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub timestamp: String,
    /// `true` for container output, `false` for frames the service adds.
    pub raw: bool,
}

impl LogFrame {
    pub fn from_line(line: &str) -> Self {
        Self {
            kind: classify(line),
            message: line.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            raw: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Error,
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            raw: false,
        }
    }
}

/// Reassembles lines from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Append a chunk and return the lines it completes, without their
    /// terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// The unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let raw = std::mem::take(&mut self.pending);
            Some(decode_line(&raw))
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Build the SSE body for a container's logs.
///
/// The caller has already checked that the container exists.
pub fn log_event_stream(
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    follow: bool,
    tail: Option<usize>,
    retry_ms: u64,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        yield Ok(sse::retry_frame(retry_ms));

        let mut upstream = runtime.logs(&id, follow, tail);
        let mut splitter = LineSplitter::default();
        let mut failure = None;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    for line in splitter.push(&chunk) {
                        yield Ok(sse::json_frame(&LogFrame::from_line(&line)));
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(upstream);
        if failure.is_none()
            && let Some(rest) = splitter.finish()
        {
            yield Ok(sse::json_frame(&LogFrame::from_line(&rest)));
        }

        let gone = match failure {
            Some(RuntimeError::NotFound { .. }) => true,
            Some(e) => {
                debug!(container_id = %id, error = %e, "Log stream failed");
                yield Ok(sse::json_frame(&LogFrame::error(e.to_string())));
                return;
            }
            None => {
                follow
                    && matches!(
                        runtime.inspect_container(&id).await,
                        Err(RuntimeError::NotFound { .. })
                    )
            }
        };
        if gone {
            debug!(container_id = %id, "Container disappeared during log stream");
            yield Ok(sse::json_frame(&LogFrame::error(format!(
                "container {id} is no longer available"
            ))));
            return;
        }
        yield Ok(sse::done_frame());
    }
}
