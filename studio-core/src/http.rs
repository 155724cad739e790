//! axum helpers shared by every TT Studio HTTP surface.

use crate::auth::ServiceAuth;
use crate::error::StudioError;
use crate::sse;
use axum::Router;
use axum::body::Body;
use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// JSON body extractor whose rejection is an `invalid_request` error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = StudioError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(StudioError::invalid_request(rejection.body_text())),
        }
    }
}

/// Query-string extractor whose rejection is an `invalid_request` error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryArgs<T>(pub T);

impl<S, T> FromRequestParts<S> for QueryArgs<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = StudioError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(StudioError::invalid_request(rejection.body_text())),
        }
    }
}

/// Parse an optional JSON body: an empty body yields `T::default()`.
pub fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, StudioError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        serde_json::from_slice(body).map_err(StudioError::from)
    }
}

/// Reject requests without a valid service token.
///
/// On success the verified [`crate::auth::ServiceClaims`] are stored in the
/// request extensions.
pub async fn require_service_token(
    State(auth): State<Arc<ServiceAuth>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default());
    match auth.verify_header(header) {
        Ok(claims) => {
            debug!(service = %claims.service, path = %req.uri().path(), "Service authenticated");
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => StudioError::from(e).into_response(),
    }
}

/// Wrap a frame stream as a `text/event-stream` response.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    Response::builder()
        .header(CONTENT_TYPE, sse::CONTENT_TYPE)
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| StudioError::internal(e.to_string()).into_response())
}

/// Bind `addr` and serve `app` until `shutdown` is cancelled.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    name: &'static str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(service = name, addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!(service = name, "Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DEFAULT_TOKEN_TTL;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde::Deserialize;
    use tower::ServiceExt;

    #[derive(Deserialize)]
    struct Payload {
        n: u32,
    }

    fn app(auth: Arc<ServiceAuth>) -> Router {
        Router::new()
            .route(
                "/echo",
                post(|JsonBody(p): JsonBody<Payload>| async move { p.n.to_string() }),
            )
            .route(
                "/q",
                get(|QueryArgs(p): QueryArgs<Payload>| async move { p.n.to_string() }),
            )
            .layer(axum::middleware::from_fn_with_state(
                auth,
                require_service_token,
            ))
    }

    async fn error_kind(resp: Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["error_kind"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let auth = Arc::new(ServiceAuth::new("s"));
        let resp = app(auth)
            .oneshot(Request::builder().uri("/q?n=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_kind(resp).await, "unauthenticated");
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized() {
        let auth = Arc::new(ServiceAuth::new("s"));
        let token = ServiceAuth::new("other").issue("x", DEFAULT_TOKEN_TTL).unwrap();
        let resp = app(auth)
            .oneshot(
                Request::builder()
                    .uri("/q?n=1")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(error_kind(resp).await, "unauthorized");
    }

    #[tokio::test]
    async fn test_extractor_rejections_are_invalid_request() {
        let auth = Arc::new(ServiceAuth::new("s"));
        let token = auth.issue("x", DEFAULT_TOKEN_TTL).unwrap();
        let resp = app(auth.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"n\": \"nope\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(resp).await, "invalid_request");

        let resp = app(auth)
            .oneshot(
                Request::builder()
                    .uri("/q?n=7")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Opts {
        force: bool,
    }

    #[test]
    fn test_optional_json() {
        assert_eq!(optional_json::<Opts>(b"").unwrap(), Opts::default());
        assert_eq!(optional_json::<Opts>(b" \n").unwrap(), Opts::default());
        assert!(optional_json::<Opts>(b"{\"force\": true}").unwrap().force);
        let err = optional_json::<Opts>(b"{oops").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_sse_response_headers() {
        let stream = futures::stream::iter(vec![Ok(sse::done_frame())]);
        let resp = sse_response(stream);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/event-stream");
        let body = axum::body::to_bytes(resp.into_body(), 1000).await.unwrap();
        assert_eq!(body, Bytes::from("data: [DONE]\n\n"));
    }
}
