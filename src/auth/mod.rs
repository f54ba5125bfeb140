//! Authentication and principal extraction
//!
//! Verifies JWT bearer tokens and produces the [Principal] the query
//! pipeline consumes. The pipeline itself never inspects tokens; it only
//! sees "is authenticated", the user id and the role name.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// The caller identity as seen by the query pipeline.
///
/// An unauthenticated request carries a principal with no user id; the
/// permission layer decides what that principal may see.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

impl Principal {
    /// Principal for a request without (valid) credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Role name, empty when anonymous or the token carried none.
    pub fn role_name(&self) -> &str {
        self.role.as_deref().unwrap_or("")
    }
}

/// Claims structure for access tokens
#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    role: String,
    #[allow(dead_code)]
    exp: i64,
}

/// Verify a JWT token and extract the principal
pub fn verify_token(token: &str, jwt_secret: &str) -> Result<Principal, ApiError> {
    let jwt_secret = jwt_secret.trim();

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;

    let token_data = decode::<AccessTokenClaims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "JWT verification failed");
        ApiError::Unauthorized(format!("invalid token: {e}"))
    })?;

    Ok(Principal {
        user_id: Some(token_data.claims.sub),
        role: Some(token_data.claims.role),
    })
}

/// Extract the principal from request headers.
///
/// A missing Authorization header yields the anonymous principal; a present
/// but invalid bearer token is rejected.
pub fn principal_from_headers(headers: &HeaderMap, jwt_secret: &str) -> Result<Principal, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(Principal::anonymous());
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("malformed authorization header".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| ApiError::Unauthorized("expected bearer token".into()))?;
    verify_token(token.trim(), jwt_secret)
}
