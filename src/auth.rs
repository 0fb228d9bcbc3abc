//! Session authentication.
//!
//! Requests carry a signed session token either as a `Bearer` authorization
//! header or a `session` cookie. The token is a JWT whose subject is the user
//! id; handlers receive it through the [`AuthenticatedUser`] extractor and
//! get a 401 before any business logic runs when it is missing or invalid.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::ServiceError, AppState};

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    /// Role: "customer" or "admin"
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

/// Extracted identity of the caller.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub role: String,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Issues a session token. Used by the sign-in surface (out of scope here)
/// and by the test harness.
pub fn issue_session_token(
    user_id: Uuid,
    role: &str,
    secret: &str,
    ttl_secs: i64,
) -> Result<String, ServiceError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp: (now + Duration::seconds(ttl_secs)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ServiceError::Unauthorized(format!("failed to sign session token: {}", e)))
}

fn decode_session_token(token: &str, secret: &str) -> Result<Claims, ServiceError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ServiceError::Unauthorized("invalid or expired session".to_string()))
}

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    // Fall back to the session cookie
    let cookies = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut split = pair.trim().splitn(2, '=');
        if split.next() == Some(SESSION_COOKIE) {
            return split.next().map(|v| v.to_string());
        }
    }
    None
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .ok_or_else(|| ServiceError::Unauthorized("missing session credentials".to_string()))?;
        let claims = decode_session_token(&token, &state.config.jwt_secret)?;
        Ok(AuthenticatedUser {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}
