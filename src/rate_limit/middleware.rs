use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::{classify, ClientIp};
use crate::{error::AppError, state::AppState};

/// Applies the per-action limit to login, registration and other API
/// mutations. Requests that match no action pass through untouched.
pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(action) = classify(request.method(), request.uri().path()) else {
        return Ok(next.run(request).await);
    };
    state
        .limiter
        .check(state.store.as_ref(), action, &ip)
        .await?;
    Ok(next.run(request).await)
}
