//! The streaming proxy.
//!
//! Each request runs one reader task that pulls from the upstream stream and
//! pushes SSE frames into a bounded channel; the response body drains the
//! other end. When the client goes away the receiver is dropped, the reader
//! notices through `Sender::closed` and drops the upstream stream, which
//! aborts the HTTP request.

use crate::chunk::parse_chunk;
use crate::metrics::MetricsTracker;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use studio_core::config::InferenceConfig;
use studio_core::error::StudioError;
use studio_core::llm::{ChatBackend, ChatRequest, LlmError};
use studio_core::sse::{self, DONE};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};

/// Per-stream limits.
#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    pub channel_capacity: usize,
    /// Longest silence tolerated between upstream chunks.
    pub idle_timeout: Duration,
}

impl ProxySettings {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&InferenceConfig::default())
    }
}

/// The frame sent in place of the metrics when the upstream fails.
pub fn error_frame(error: &StudioError) -> Bytes {
    sse::json_frame(&json!({
        "type": "error",
        "error_kind": error.kind.as_str(),
        "message": error.message,
    }))
}

/// Start proxying `request` and return the client-facing frame stream.
///
/// Frames are forwarded verbatim in upstream order. After the upstream ends
/// cleanly one metrics frame and `[DONE]` follow. An upstream failure yields
/// a single error frame and closes the stream.
pub fn proxy_stream(
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    settings: ProxySettings,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Bytes>(settings.channel_capacity);
    let span = info_span!("inference_stream", model = %request.model, backend = backend.name());
    tokio::spawn(read_upstream(backend, request, settings, tx).instrument(span));
    ReceiverStream::new(rx).map(Ok)
}

async fn read_upstream(
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    settings: ProxySettings,
    tx: mpsc::Sender<Bytes>,
) {
    let mut metrics = MetricsTracker::start();

    let started = tokio::select! {
        _ = tx.closed() => {
            info!("Client disconnected before upstream answered");
            return;
        }
        started = backend.generate(request) => started,
    };
    let mut upstream = match started {
        Ok(stream) => stream,
        Err(e) => {
            fail(&tx, e).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                info!(tokens = metrics.tokens_decoded(), "Client disconnected; cancelling upstream");
                return;
            }
            next = tokio::time::timeout(settings.idle_timeout, upstream.next()) => next,
        };

        let payload = match next {
            Ok(Some(Ok(payload))) => payload,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                fail(&tx, e).await;
                return;
            }
            Err(_) => {
                fail(
                    &tx,
                    LlmError::Timeout {
                        stage: "waiting for next upstream chunk".into(),
                        timeout_secs: settings.idle_timeout.as_secs(),
                    },
                )
                .await;
                return;
            }
        };

        if payload.trim() == DONE {
            break;
        }
        match parse_chunk(&payload) {
            Ok(chunk) => {
                if let Some(usage) = chunk.usage {
                    metrics.observe(usage);
                }
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed upstream chunk");
                continue;
            }
        }
        if tx.send(sse::data_frame(&payload)).await.is_err() {
            info!("Client disconnected; cancelling upstream");
            return;
        }
    }

    let summary = metrics.finish();
    debug!(
        ttft = ?summary.ttft,
        tpot = summary.tpot,
        tokens = summary.tokens_decoded,
        "Upstream stream finished"
    );
    if tx.send(sse::json_frame(&summary)).await.is_ok() {
        let _ = tx.send(sse::done_frame()).await;
    }
}

async fn fail(tx: &mpsc::Sender<Bytes>, error: LlmError) {
    warn!(error = %error, "Upstream inference failed");
    let error = StudioError::from(error);
    let _ = tx.send(error_frame(&error)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_core::llm::{
        ChatMessage, Sampling, ScriptStep, ScriptedBackend, completion_chunk,
    };
    use studio_core::sse::{SseDecoder, SseEvent};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "echo".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![],
            sampling: Sampling {
                temperature: 1.0,
                top_k: 20,
                top_p: 0.9,
                max_tokens: 16,
            },
        }
    }

    fn step(ms: u64, item: Result<String, LlmError>) -> ScriptStep {
        ScriptStep {
            delay: Duration::from_millis(ms),
            item,
        }
    }

    async fn payloads<S>(stream: S) -> Vec<String>
    where
        S: Stream<Item = Result<Bytes, Infallible>>,
    {
        let frames: Vec<_> = stream.collect().await;
        let mut decoder = SseDecoder::new();
        let mut out = Vec::new();
        for frame in frames {
            let Ok(frame) = frame;
            for event in decoder.push(&frame) {
                if let SseEvent::Data(d) = event {
                    out.push(d);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_frames_forwarded_then_metrics_then_done() {
        let backend = Arc::new(ScriptedBackend::reply("one two three", 4));
        let out = payloads(proxy_stream(backend, request(), ProxySettings::default())).await;

        assert_eq!(out.len(), 5);
        assert_eq!(out[0], completion_chunk("one ", Some((4, 1))));
        assert_eq!(out[2], completion_chunk("three", Some((4, 3))));
        let metrics: serde_json::Value = serde_json::from_str(&out[3]).unwrap();
        assert_eq!(metrics["tokens_decoded"], 3);
        assert_eq!(metrics["tokens_prefilled"], 4);
        assert_eq!(metrics["context_length"], 7);
        assert_eq!(out[4], DONE);
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_skipped() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            step(0, Ok(completion_chunk("a", Some((1, 1))))),
            step(0, Ok("garbage".into())),
            step(0, Ok(completion_chunk("b", Some((1, 2))))),
        ]));
        let out = payloads(proxy_stream(backend, request(), ProxySettings::default())).await;
        assert_eq!(out.len(), 4);
        assert!(!out.iter().any(|p| p == "garbage"));
        assert_eq!(out[3], DONE);
    }

    #[tokio::test]
    async fn test_upstream_http_error_is_single_error_frame() {
        let backend = Arc::new(ScriptedBackend::failing(LlmError::Http {
            status: 503,
            body: "warming up".into(),
        }));
        let out = payloads(proxy_stream(backend, request(), ProxySettings::default())).await;
        assert_eq!(out.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error_kind"], "upstream");
    }

    #[tokio::test]
    async fn test_mid_stream_error_stops_without_metrics() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            step(0, Ok(completion_chunk("a", Some((1, 1))))),
            step(
                0,
                Err(LlmError::Streaming {
                    message: "reset".into(),
                }),
            ),
            step(0, Ok(completion_chunk("b", Some((1, 2))))),
        ]));
        let out = payloads(proxy_stream(backend, request(), ProxySettings::default())).await;
        assert_eq!(out.len(), 2);
        let frame: serde_json::Value = serde_json::from_str(&out[1]).unwrap();
        assert_eq!(frame["type"], "error");
        assert!(!out.iter().any(|p| p == DONE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_upstream_times_out() {
        let backend = Arc::new(ScriptedBackend::reply("slow", 1).hang_after());
        let settings = ProxySettings {
            channel_capacity: 4,
            idle_timeout: Duration::from_secs(2),
        };
        let out = payloads(proxy_stream(backend, request(), settings)).await;
        assert_eq!(out.len(), 2);
        let frame: serde_json::Value = serde_json::from_str(&out[1]).unwrap();
        assert_eq!(frame["error_kind"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timing_reaches_metrics_frame() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            step(100, Ok(completion_chunk("a", Some((7, 1))))),
            step(50, Ok(completion_chunk("b", Some((7, 2))))),
            step(50, Ok(completion_chunk("c", Some((7, 3))))),
            step(200, Ok(completion_chunk("de", Some((7, 5))))),
            step(0, Ok(completion_chunk("", Some((7, 5))))),
        ]));
        let out = payloads(proxy_stream(backend, request(), ProxySettings::default())).await;
        let metrics: crate::metrics::StreamMetrics =
            serde_json::from_str(&out[out.len() - 2]).unwrap();
        assert!((metrics.ttft.unwrap() - 0.10).abs() < 0.005);
        assert!((metrics.tpot_median - 0.05).abs() < 0.005);
        assert_eq!(metrics.tokens_decoded, 5);
        assert_eq!(metrics.tokens_prefilled, 7);
        assert_eq!(metrics.context_length, 12);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_upstream() {
        let backend = ScriptedBackend::reply("first", 1).hang_after();
        let mut stream = Box::pin(proxy_stream(
            Arc::new(backend.clone()),
            request(),
            ProxySettings::default(),
        ));
        assert!(stream.next().await.is_some());
        drop(stream);

        for _ in 0..50 {
            if backend.was_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.was_cancelled());
    }
}
