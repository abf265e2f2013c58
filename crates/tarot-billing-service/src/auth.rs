//! Request authentication.
//!
//! Three callers reach this service:
//! - readers of the app, carrying an HS256 session token minted by the auth
//!   front-end with the shared `SESSION_SECRET`, either as
//!   `Authorization: Bearer` or in the `session` cookie ([`AuthUser`]);
//! - the auth front-end itself, registering accounts with `X-API-Key`
//!   ([`ServiceAuth`]);
//! - support staff granting credits with `X-Admin-Key` ([`AdminAuth`]).

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use tarot_billing_core::UserId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session";

/// The reader making the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Subject of the session token.
    pub user_id: UserId,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| session_cookie(parts))
            .ok_or(ApiError::Unauthorized)?;

        let Some(secret) = state.config.session_secret.as_deref() else {
            tracing::warn!("SESSION_SECRET not configured; rejecting reader request");
            return Err(ApiError::Unauthorized);
        };

        let user_id = validate_token(&token, secret)?
            .sub
            .parse::<UserId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(Self { user_id })
    }
}

/// The auth front-end, identified by the service API key.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// Value of `X-Service-Name`, for logs.
    pub service_name: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        require_key(parts, "x-api-key", state.config.service_api_key.as_deref())?;

        Ok(Self {
            service_name: header_or(parts, "x-service-name", "unknown"),
        })
    }
}

/// Support staff, identified by the admin API key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Value of `X-Admin-Id`, recorded on every grant.
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        require_key(parts, "x-admin-key", state.config.admin_api_key.as_deref())?;

        let admin_id = header_or(parts, "x-admin-id", "admin");
        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(Self { admin_id })
    }
}

/// Compare the key in `header` with the configured one. An unset key
/// rejects every caller.
fn require_key(parts: &Parts, header: &str, expected: Option<&str>) -> Result<(), ApiError> {
    let presented = parts
        .headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let expected = expected.ok_or(ApiError::Unauthorized)?;

    if constant_time_eq(presented, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn header_or(parts: &Parts, name: &str, default: &str) -> String {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default)
        .to_string()
}

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: i64,
}

impl SessionClaims {
    /// Claims for `user_id`, valid for `ttl` from now.
    #[must_use]
    pub fn new(user_id: UserId, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }
}

/// Sign session claims with the shared secret.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn issue_token(
    claims: &SessionClaims,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn validate_token(token: &str, secret: &str) -> Result<SessionClaims, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Session token validation failed");
        ApiError::Unauthorized
    })?;
    Ok(data.claims)
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn session_cookie(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: (&str, &str)) -> Parts {
        Request::builder()
            .header(header.0, header.1)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn token_round_trips_with_same_secret() {
        let claims = SessionClaims::new(UserId::new(7), Duration::hours(1));
        let token = issue_token(&claims, "s3cret").unwrap();
        assert_eq!(validate_token(&token, "s3cret").unwrap().sub, "7");
        assert!(validate_token(&token, "other").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = SessionClaims::new(UserId::new(7), Duration::hours(-2));
        let token = issue_token(&claims, "s3cret").unwrap();
        assert!(validate_token(&token, "s3cret").is_err());
    }

    #[test]
    fn token_is_read_from_cookie() {
        let p = parts(("cookie", "theme=dark; session=abc.def.ghi"));
        assert_eq!(session_cookie(&p).as_deref(), Some("abc.def.ghi"));
        assert!(bearer_token(&p).is_none());
    }

    #[test]
    fn token_is_read_from_bearer_header() {
        let p = parts(("authorization", "Bearer xyz"));
        assert_eq!(bearer_token(&p).as_deref(), Some("xyz"));
        assert!(session_cookie(&p).is_none());
    }

    #[test]
    fn api_key_must_match_configured_key() {
        let p = parts(("x-api-key", "k1"));
        assert!(require_key(&p, "x-api-key", Some("k1")).is_ok());
        assert!(require_key(&p, "x-api-key", Some("k2")).is_err());
        assert!(require_key(&p, "x-api-key", None).is_err());
        assert!(require_key(&p, "x-admin-key", Some("k1")).is_err());
    }
}
