//! Error kinds shared across every TT Studio service.
//!
//! `ErrorKind` is the machine-readable vocabulary that crosses service
//! boundaries as the `error_kind` JSON field. `StudioError` pairs a kind with
//! a human-readable message and renders itself as an HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error kind, serialized verbatim across services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorized,
    ForbiddenImage,
    ForbiddenNetwork,
    ForbiddenPrivilege,
    UnknownModel,
    WeightsMismatch,
    NotFound,
    AlreadyExists,
    StillRunning,
    InUse,
    InvalidRequest,
    RuntimeUnavailable,
    ResourceExhausted,
    Timeout,
    Upstream,
    LowSimilarity,
    UnsupportedFact,
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 19] = [
        ErrorKind::Unauthenticated,
        ErrorKind::Unauthorized,
        ErrorKind::ForbiddenImage,
        ErrorKind::ForbiddenNetwork,
        ErrorKind::ForbiddenPrivilege,
        ErrorKind::UnknownModel,
        ErrorKind::WeightsMismatch,
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::StillRunning,
        ErrorKind::InUse,
        ErrorKind::InvalidRequest,
        ErrorKind::RuntimeUnavailable,
        ErrorKind::ResourceExhausted,
        ErrorKind::Timeout,
        ErrorKind::Upstream,
        ErrorKind::LowSimilarity,
        ErrorKind::UnsupportedFact,
        ErrorKind::Internal,
    ];

    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ForbiddenImage => "forbidden_image",
            ErrorKind::ForbiddenNetwork => "forbidden_network",
            ErrorKind::ForbiddenPrivilege => "forbidden_privilege",
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::WeightsMismatch => "weights_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::StillRunning => "still_running",
            ErrorKind::InUse => "in_use",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Upstream => "upstream",
            ErrorKind::LowSimilarity => "low_similarity",
            ErrorKind::UnsupportedFact => "unsupported_fact",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse a wire name. Unknown names map to `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// HTTP status used when this kind terminates a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Unauthenticated | ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::ForbiddenImage
            | ErrorKind::ForbiddenNetwork
            | ErrorKind::ForbiddenPrivilege
            | ErrorKind::UnknownModel
            | ErrorKind::WeightsMismatch
            | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::StillRunning | ErrorKind::InUse => {
                StatusCode::CONFLICT
            }
            ErrorKind::LowSimilarity | ErrorKind::UnsupportedFact => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::RuntimeUnavailable | ErrorKind::ResourceExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RuntimeUnavailable | ErrorKind::Timeout)
    }

    /// Whitelist violations are final; the request must change.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            ErrorKind::ForbiddenImage | ErrorKind::ForbiddenNetwork | ErrorKind::ForbiddenPrivilege
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carrying a wire kind and a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StudioError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StudioError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn timeout(what: impl fmt::Display, after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{what} timed out after {}ms", after.as_millis()),
        )
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// JSON body used on the wire.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error_kind: self.kind,
            message: self.message.clone(),
        }
    }
}

/// Wire representation of a [`StudioError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl From<ErrorBody> for StudioError {
    fn from(body: ErrorBody) -> Self {
        Self::new(body.error_kind, body.message)
    }
}

impl From<serde_json::Error> for StudioError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_request(format!("invalid JSON: {e}"))
    }
}

impl IntoResponse for StudioError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::Internal {
            tracing::error!(kind = %self.kind, message = %self.message, "Internal error");
        } else {
            tracing::debug!(kind = %self.kind, message = %self.message, "Request failed");
        }
        (self.kind.status(), axum::Json(self.body())).into_response()
    }
}

/// A type alias for results carrying a [`StudioError`].
pub type Result<T> = std::result::Result<T, StudioError>;
