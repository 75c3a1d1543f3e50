use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use time::OffsetDateTime;
use tracing::warn;

use super::{claims::Claims, jwt::TokenError, services::hash_token};
use crate::{error::AppError, state::AppState, storage::SessionStore};

/// Extracts the bearer token, validates the JWT and checks that its session
/// row is still live.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
    pub token: String,
}

/// `Bearer <token>`, scheme matched case-insensitively.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(TokenError::Missing)?;

        let claims = state.jwt.verify(token).map_err(|e| {
            warn!(error = %e, "bearer token rejected");
            e
        })?;

        let active = state
            .store
            .session_active(&hash_token(token), OffsetDateTime::now_utc())
            .await?;
        if !active {
            warn!(user_id = %claims.sub, "token has no live session");
            return Err(TokenError::Revoked.into());
        }

        Ok(AuthUser {
            claims,
            token: token.to_string(),
        })
    }
}
