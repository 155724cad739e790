//! Deployment routes of the backend API.

use crate::store::DeploymentStatus;
use crate::supervisor::{DeployRequest, Supervisor};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use studio_core::error::StudioError;
use studio_core::http::{JsonBody, QueryArgs};

type ApiResult<T> = Result<T, StudioError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListQuery {
    status: Option<DeploymentStatus>,
}

/// Routes for `/api/v1/models` and `/api/v1/deployments`.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/v1/models", get(list_models))
        .route(
            "/api/v1/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route("/api/v1/deployments/{id}", get(get_deployment))
        .route("/api/v1/deployments/{id}/stop", post(stop_deployment))
        .with_state(supervisor)
}

async fn list_models(State(sup): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(sup.catalog().all())
}

async fn create_deployment(
    State(sup): State<Arc<Supervisor>>,
    JsonBody(request): JsonBody<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = sup.deploy(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_deployments(
    State(sup): State<Arc<Supervisor>>,
    QueryArgs(query): QueryArgs<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sup.list(query.status).await?))
}

async fn get_deployment(
    State(sup): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sup.get(&id).await?))
}

async fn stop_deployment(
    State(sup): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sup.stop(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LocalCcs, supervisor_with};
    use axum::body::Body;
    use axum::http::{Request, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

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
    async fn test_deploy_list_stop_over_http() {
        let ccs = LocalCcs::new();
        let app = router(supervisor_with(&ccs, 7001..=7010));

        let (status, models) = call(&app, "GET", "/api/v1/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(models.as_array().unwrap().iter().any(|m| m["id"] == "echo"));

        let (status, record) = call(
            &app,
            "POST",
            "/api/v1/deployments",
            Some(json!({"model_id": "echo"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["status"], "running");
        assert_eq!(record["port"], 7001);
        let id = record["deploy_id"].as_str().unwrap().to_string();

        let (_, running) = call(&app, "GET", "/api/v1/deployments?status=running", None).await;
        assert_eq!(running.as_array().unwrap().len(), 1);

        let (status, stopped) =
            call(&app, "POST", &format!("/api/v1/deployments/{id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["status"], "stopped");
        assert_eq!(stopped["stopped_by_user"], true);

        let (_, running) = call(&app, "GET", "/api/v1/deployments?status=running", None).await;
        assert!(running.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_kinds_over_http() {
        let ccs = LocalCcs::new();
        let app = router(supervisor_with(&ccs, 7001..=7010));

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/deployments",
            Some(json!({"model_id": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "unknown_model");

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/deployments",
            Some(json!({"model_id": "echo", "weights_path": "ft/1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "weights_mismatch");

        let (status, body) = call(&app, "GET", "/api/v1/deployments/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], "not_found");

        let (status, body) = call(&app, "GET", "/api/v1/deployments?status=zombie", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "invalid_request");
    }
}
