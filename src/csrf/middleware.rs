use axum::{
    extract::{Request, State},
    http::{header::SET_COOKIE, Method},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::{cookie_value, SIGNED_COOKIE, TOKEN_COOKIE};
use crate::{error::AppError, state::AppState};

/// Verifies state-changing API requests and hands out a token pair on safe
/// requests that lack one. Tokens are not rotated while both cookies exist.
pub async fn csrf_protect(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method().clone();

    if matches!(method, Method::GET | Method::HEAD | Method::OPTIONS) {
        let headers = request.headers();
        let needs_issue = cookie_value(headers, TOKEN_COOKIE).is_none()
            || cookie_value(headers, SIGNED_COOKIE).is_none();
        let mut response = next.run(request).await;
        if needs_issue {
            let issued = state.csrf.issue();
            for cookie in state.csrf.set_cookies(&issued)? {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            debug!("csrf token issued");
        }
        return Ok(response);
    }

    let guarded = matches!(
        method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) && request.uri().path().starts_with("/api/");
    if guarded {
        if let Err(e) = state.csrf.verify(request.headers()) {
            warn!(error = %e, %method, path = %request.uri().path(), "csrf check failed");
            return Err(e.into());
        }
    }

    Ok(next.run(request).await)
}
