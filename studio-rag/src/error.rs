//! Errors from the vector store and embedding backends.

use studio_core::error::{ErrorKind, StudioError};

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Vector store unreachable: {0}")]
    Connection(String),

    #[error("Vector store returned HTTP {status}: {body}")]
    Store { status: u16, body: String },

    #[error("Vector store request timed out after {0}s")]
    Timeout(u64),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Malformed vector store response: {0}")]
    Decode(String),
}

impl RagError {
    pub(crate) fn from_reqwest(e: reqwest::Error, timeout_secs: u64) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout_secs)
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<RagError> for StudioError {
    fn from(e: RagError) -> Self {
        let kind = match &e {
            RagError::CollectionNotFound(_) => ErrorKind::NotFound,
            RagError::CollectionExists(_) => ErrorKind::AlreadyExists,
            RagError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RagError::Timeout(_) => ErrorKind::Timeout,
            RagError::Connection(_)
            | RagError::Store { .. }
            | RagError::Embedding(_)
            | RagError::Decode(_) => ErrorKind::Upstream,
        };
        StudioError::new(kind, e.to_string())
    }
}
