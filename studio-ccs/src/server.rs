//! HTTP surface of the Container Control Service.
//!
//! Every route except `health` and `ready` sits behind the service-token
//! middleware. CORS is locked to the configured backend origins.

use crate::service::ContainerService;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use studio_core::auth::{ServiceAuth, ServiceClaims};
use studio_core::config::CcsConfig;
use studio_core::error::StudioError;
use studio_core::http::{JsonBody, QueryArgs, optional_json, require_service_token, sse_response};
use studio_core::types::{
    Ack, CreateNetworkRequest, HealthStatus, NetworkAttachRequest, PullImageRequest,
    RemoveRequest, RunContainerSpec, StopRequest,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state of the CCS router.
#[derive(Debug, Clone)]
pub struct CcsState {
    pub service: ContainerService,
}

type ApiResult<T> = Result<T, StudioError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListQuery {
    all: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogsQuery {
    follow: bool,
    tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    name: String,
    #[serde(default = "latest")]
    tag: String,
    #[serde(default)]
    force: bool,
}

fn latest() -> String {
    "latest".to_string()
}

/// Build the CCS router.
pub fn router(service: ContainerService, auth: Arc<ServiceAuth>, config: &CcsConfig) -> Router {
    let state = CcsState { service };

    let protected = Router::new()
        .route("/api/v1/containers", get(list_containers))
        .route("/api/v1/containers/run", post(run_container))
        .route("/api/v1/containers/{id}", get(get_container))
        .route("/api/v1/containers/{id}/stop", post(stop_container))
        .route("/api/v1/containers/{id}/remove", post(remove_container))
        .route("/api/v1/containers/{id}/logs", get(stream_logs))
        .route("/api/v1/images", axum::routing::delete(remove_image))
        .route("/api/v1/images/exists", get(image_exists))
        .route("/api/v1/images/pull", post(pull_image))
        .route("/api/v1/networks", get(list_networks).post(create_network))
        .route(
            "/api/v1/networks/{name}",
            axum::routing::delete(remove_network),
        )
        .route("/api/v1/networks/{name}/connect", post(connect_network))
        .route("/api/v1/networks/{name}/disconnect", post(disconnect_network))
        .layer(axum::middleware::from_fn_with_state(
            auth,
            require_service_token,
        ));

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ready", get(ready))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

fn caller(claims: &ServiceClaims) -> &str {
    claims.service.as_str()
}

async fn health(State(state): State<CcsState>) -> impl IntoResponse {
    // Always 200 so orchestrators can read the sub-checks.
    Json(state.service.health().await)
}

async fn ready(State(state): State<CcsState>) -> Response {
    if state.service.ready().await {
        (StatusCode::OK, Json(json!({"status": HealthStatus::Healthy}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": HealthStatus::Unhealthy})),
        )
            .into_response()
    }
}

async fn list_containers(
    State(state): State<CcsState>,
    QueryArgs(query): QueryArgs<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_containers(query.all).await?))
}

async fn get_container(
    State(state): State<CcsState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_container(&id).await?))
}

async fn run_container(
    State(state): State<CcsState>,
    Extension(claims): Extension<ServiceClaims>,
    JsonBody(spec): JsonBody<RunContainerSpec>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.service.run_container(spec, caller(&claims)).await?,
    ))
}

async fn stop_container(
    State(state): State<CcsState>,
    Extension(claims): Extension<ServiceClaims>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: StopRequest = optional_json(&body)?;
    let grace = request.timeout_seconds.map(Duration::from_secs);
    state
        .service
        .stop_container(&id, grace, caller(&claims))
        .await?;
    Ok(Json(Ack::OK))
}

async fn remove_container(
    State(state): State<CcsState>,
    Extension(claims): Extension<ServiceClaims>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let force = optional_json::<RemoveRequest>(&body)?.force;
    state
        .service
        .remove_container(&id, force, caller(&claims))
        .await?;
    Ok(Json(Ack::OK))
}

async fn stream_logs(
    State(state): State<CcsState>,
    Path(id): Path<String>,
    QueryArgs(query): QueryArgs<LogsQuery>,
) -> ApiResult<Response> {
    let stream = state
        .service
        .stream_logs(&id, query.follow, query.tail)
        .await?;
    Ok(sse_response(stream))
}

async fn image_exists(
    State(state): State<CcsState>,
    QueryArgs(query): QueryArgs<ImageQuery>,
) -> ApiResult<impl IntoResponse> {
    let exists = state.service.image_exists(&query.name, &query.tag).await?;
    Ok(Json(json!({"exists": exists})))
}

async fn remove_image(
    State(state): State<CcsState>,
    Extension(claims): Extension<ServiceClaims>,
    QueryArgs(query): QueryArgs<ImageQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .service
        .remove_image(&query.name, &query.tag, query.force, caller(&claims))
        .await?;
    Ok(Json(Ack::OK))
}

async fn pull_image(
    State(state): State<CcsState>,
    JsonBody(request): JsonBody<PullImageRequest>,
) -> ApiResult<Response> {
    let stream = state.service.pull_image(&request.name, &request.tag)?;
    Ok(sse_response(stream))
}

async fn list_networks(State(state): State<CcsState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_networks().await?))
}

async fn create_network(
    State(state): State<CcsState>,
    JsonBody(request): JsonBody<CreateNetworkRequest>,
) -> ApiResult<impl IntoResponse> {
    let network = state
        .service
        .create_network(&request.name, request.driver.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn remove_network(
    State(state): State<CcsState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.service.remove_network(&name).await?;
    Ok(Json(Ack::OK))
}

async fn connect_network(
    State(state): State<CcsState>,
    Path(name): Path<String>,
    JsonBody(request): JsonBody<NetworkAttachRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .service
        .connect_network(&name, &request.container)
        .await?;
    Ok(Json(Ack::OK))
}

async fn disconnect_network(
    State(state): State<CcsState>,
    Path(name): Path<String>,
    JsonBody(request): JsonBody<NetworkAttachRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .service
        .disconnect_network(&name, &request.container, request.force)
        .await?;
    Ok(Json(Ack::OK))
}
