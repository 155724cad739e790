//! RAG routes of the backend API.

use crate::chunking::ChunkStrategy;
use crate::gateway::QueryOptions;
use crate::pipeline::{AnswerRequest, RagPipeline};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use studio_core::error::StudioError;
use studio_core::http::JsonBody;
use studio_core::types::Ack;

type ApiResult<T> = Result<T, StudioError>;

#[derive(Debug, Deserialize)]
struct CreateCollection {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    chunking: Option<ChunkStrategy>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(flatten)]
    options: QueryOptions,
}

/// Routes under `/api/v1/rag`.
pub fn router(pipeline: Arc<RagPipeline>) -> Router {
    Router::new()
        .route(
            "/api/v1/rag/collections",
            get(list_collections).post(create_collection),
        )
        .route(
            "/api/v1/rag/collections/{name}",
            get(get_collection).delete(delete_collection),
        )
        .route("/api/v1/rag/collections/{name}/documents", post(ingest))
        .route("/api/v1/rag/collections/{name}/query", post(query))
        .route("/api/v1/rag/collections/{name}/answer", post(answer))
        .with_state(pipeline)
}

async fn list_collections(State(p): State<Arc<RagPipeline>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(p.gateway().list_collections().await?))
}

async fn create_collection(
    State(p): State<Arc<RagPipeline>>,
    JsonBody(body): JsonBody<CreateCollection>,
) -> ApiResult<impl IntoResponse> {
    let info = p.gateway().create_collection(&body.name).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_collection(
    State(p): State<Arc<RagPipeline>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(p.gateway().get_collection(&name).await?))
}

async fn delete_collection(
    State(p): State<Arc<RagPipeline>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    p.gateway().delete_collection(&name).await?;
    Ok(Json(Ack::OK))
}

async fn ingest(
    State(p): State<Arc<RagPipeline>>,
    Path(name): Path<String>,
    JsonBody(body): JsonBody<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = body.source.unwrap_or_else(|| "upload".to_string());
    let report = p
        .gateway()
        .ingest(
            &name,
            &body.text,
            &source,
            body.document_id,
            body.chunking.unwrap_or_default(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn query(
    State(p): State<Arc<RagPipeline>>,
    Path(name): Path<String>,
    JsonBody(body): JsonBody<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(p.gateway().query(&name, &body.query, &body.options).await?))
}

async fn answer(
    State(p): State<Arc<RagPipeline>>,
    Path(name): Path<String>,
    JsonBody(body): JsonBody<AnswerRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(p.answer(&name, &body).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::gateway::{GatewaySettings, VectorGateway};
    use crate::pipeline::testing::CannedGenerator;
    use crate::vector::InMemoryIndex;
    use axum::body::Body;
    use axum::http::{Request, header};
    use serde_json::{Value, json};
    use studio_core::config::RagConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let gateway = VectorGateway::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(LocalEmbedder::new("local-hash-384", 384)),
            GatewaySettings::default(),
        );
        let pipeline = RagPipeline::from_config(
            gateway,
            Arc::new(CannedGenerator::new("The N300 card has two Wormhole chips.")),
            &RagConfig::default(),
        );
        router(Arc::new(pipeline))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_collection_ingest_query_answer() {
        let app = app();
        let (status, info) = call(&app, "POST", "/api/v1/rag/collections", Some(json!({"name": "hw"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(info["metadata"]["hnsw:space"], "cosine");

        let (status, report) = call(
            &app,
            "POST",
            "/api/v1/rag/collections/hw/documents",
            Some(json!({
                "text": "The N300 card has two Wormhole chips. Bananas are yellow.",
                "source": "cards.txt",
                "chunking": {"strategy": "sentence", "sentences": 1, "overlap": 0}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(report["chunks"], 2);

        let (_, summary) = call(&app, "GET", "/api/v1/rag/collections/hw", None).await;
        assert_eq!(summary["count"], 2);
        assert_eq!(summary["name"], "hw");

        let (status, result) = call(
            &app,
            "POST",
            "/api/v1/rag/collections/hw/query",
            Some(json!({"query": "how many wormhole chips does the n300 card have"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["filtered_count"], 1);
        assert_eq!(result["confidence_level"], "high");

        let (status, answer) = call(
            &app,
            "POST",
            "/api/v1/rag/collections/hw/answer",
            Some(json!({"query": "how many wormhole chips does the n300 card have", "deploy_id": "d1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["refused"], false);
        assert_eq!(answer["answer"], "The N300 card has two Wormhole chips.");

        let (status, ack) = call(&app, "DELETE", "/api/v1/rag/collections/hw", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["ok"], true);
        let (status, body) = call(&app, "GET", "/api/v1/rag/collections/hw", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/v1/rag/collections", Some(json!({"name": "a"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "invalid_request");

        let (status, _) = call(&app, "POST", "/api/v1/rag/collections", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
