//! Inference route of the backend API.

use crate::service::{InferenceRequest, InferenceService};
use axum::Router;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use studio_core::error::StudioError;
use studio_core::http::{JsonBody, sse_response};

/// `POST /api/v1/inference/chat`, answered as `text/event-stream`.
pub fn router(service: InferenceService) -> Router {
    Router::new()
        .route("/api/v1/inference/chat", post(chat))
        .with_state(service)
}

async fn chat(
    State(service): State<InferenceService>,
    JsonBody(request): JsonBody<InferenceRequest>,
) -> Result<Response, StudioError> {
    let frames = service.stream(request).await?;
    Ok(sse_response(frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::service;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use studio_core::llm::ScriptedBackend;
    use tower::ServiceExt;

    fn post_chat(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/inference/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_chat_streams_sse() {
        let app = router(service(ScriptedBackend::reply("hi there", 2), false));
        let resp = app
            .oneshot(post_chat(json!({"deploy_id": "d1", "text": "hello"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            studio_core::sse::CONTENT_TYPE
        );
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"tokens_decoded\":2"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_404() {
        let app = router(service(ScriptedBackend::reply("x", 1), false));
        let resp = app
            .oneshot(post_chat(json!({"deploy_id": "nope", "text": "hello"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error_kind"], "not_found");
    }

    #[tokio::test]
    async fn test_missing_prompt_is_bad_request() {
        let app = router(service(ScriptedBackend::reply("x", 1), false));
        let resp = app
            .oneshot(post_chat(json!({"deploy_id": "d1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
