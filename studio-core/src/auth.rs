//! Service-to-service authentication with HS256 JWTs.
//!
//! Every privileged call between TT Studio processes carries
//! `Authorization: Bearer <JWT>` signed with a shared secret. The claims name
//! the calling service so the receiver can log who asked for what.

use crate::error::{ErrorKind, StudioError};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifetime of tokens minted for internal calls.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Claims carried by a service token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Identifier of the calling service (e.g. `deployment-supervisor`).
    pub service: String,
    pub iat: i64,
    pub exp: i64,
}

/// Why a request failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("malformed authorization header")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<AuthError> for StudioError {
    fn from(e: AuthError) -> Self {
        let kind = match &e {
            AuthError::Missing | AuthError::Malformed => ErrorKind::Unauthenticated,
            AuthError::Expired | AuthError::Invalid(_) => ErrorKind::Unauthorized,
            AuthError::Signing(_) => ErrorKind::Internal,
        };
        StudioError::new(kind, e.to_string())
    }
}

/// Issues and verifies service tokens for one shared secret.
#[derive(Clone)]
pub struct ServiceAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for ServiceAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAuth").finish_non_exhaustive()
    }
}

impl ServiceAuth {
    /// Create an authenticator for the given HS256 secret.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `service`, valid for `ttl`.
    pub fn issue(&self, service: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = ServiceClaims {
            service: service.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims. Exposed for tests that need expired tokens.
    pub fn sign(&self, claims: &ServiceClaims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a raw token.
    pub fn verify(&self, token: &str) -> Result<ServiceClaims, AuthError> {
        decode::<ServiceClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }

    /// Verify the value of an `Authorization` header.
    pub fn verify_header(&self, header: Option<&str>) -> Result<ServiceClaims, AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let token = bearer_token(header).ok_or(AuthError::Malformed)?;
        self.verify(token)
    }
}

/// Extract the token from `Bearer <token>`.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let auth = ServiceAuth::new("secret");
        let token = auth.issue("deployment-supervisor", DEFAULT_TOKEN_TTL).unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.service, "deployment-supervisor");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let token = ServiceAuth::new("a").issue("svc", DEFAULT_TOKEN_TTL).unwrap();
        let err = ServiceAuth::new("b").verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
        assert_eq!(StudioError::from(err).kind, ErrorKind::Unauthorized);
    }

    #[test]
    fn test_expired_token() {
        let auth = ServiceAuth::new("secret");
        let now = Utc::now().timestamp();
        let token = auth
            .sign(&ServiceClaims {
                service: "svc".into(),
                iat: now - 3600,
                exp: now - 600,
            })
            .unwrap();
        assert_eq!(auth.verify(&token).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_header_parsing() {
        let auth = ServiceAuth::new("secret");
        assert_eq!(auth.verify_header(None).unwrap_err(), AuthError::Missing);
        assert_eq!(
            auth.verify_header(Some("Basic abc")).unwrap_err(),
            AuthError::Malformed
        );
        assert_eq!(
            StudioError::from(AuthError::Missing).kind,
            ErrorKind::Unauthenticated
        );

        let token = auth.issue("svc", DEFAULT_TOKEN_TTL).unwrap();
        let header = format!("Bearer {token}");
        assert_eq!(auth.verify_header(Some(&header)).unwrap().service, "svc");
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Token abc"), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
