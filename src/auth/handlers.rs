use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        claims::Role,
        dto::{
            AuthResponse, LoginRequest, MessageResponse, ProfileResponse, PublicUser,
            RegisterRequest, UpdateProfileRequest,
        },
        extractors::AuthUser,
        password::{hash_password, verify_dummy, verify_password},
        repo_types::{NewSession, NewUser, User},
        services::{check_password_strength, hash_token, is_valid_email, normalize_email},
    },
    error::AppError,
    rate_limit::ClientIp,
    state::AppState,
    storage::{SessionStore, UserStore},
};

const MAX_NAME_LEN: usize = 100;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/register", post(register))
        .route("/auth/login", post(login))
        .route("/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/logout", post(logout))
}

pub fn profile_routes() -> Router<AppState> {
    Router::new().route("/profile", get(get_profile).put(update_profile))
}

/// Signs a token for `user` and stores its session row.
async fn start_session(
    state: &AppState,
    user: &User,
    ip: &str,
    headers: &HeaderMap,
) -> Result<String, AppError> {
    let (token, expires_at) = state.jwt.issue(user.id, &user.email, user.role)?;
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .store
        .create_session(NewSession {
            user_id: user.id,
            token_hash: hash_token(&token),
            ip_address: ip.to_string(),
            user_agent,
            expires_at,
        })
        .await?;
    Ok(token)
}

fn required_credentials(
    email: Option<String>,
    password: Option<String>,
) -> Result<(String, String), AppError> {
    let email = email.map(|e| normalize_email(&e)).unwrap_or_default();
    let password = password.unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return Err(AppError::validation("Email and password are required"));
    }
    Ok((email, password))
}

#[instrument(skip(state, headers, payload))]
pub async fn register(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let Json(payload) = payload?;
    let (email, password) = required_credentials(payload.email, payload.password)?;

    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::validation("Invalid email format"));
    }
    check_password_strength(&password)?;

    let name = payload.name.map(|n| n.trim().to_string()).unwrap_or_default();
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::validation(format!(
            "Name must be at most {MAX_NAME_LEN} characters"
        )));
    }

    let password_hash = hash_password(&password)?;
    let created = state
        .store
        .create_user(NewUser {
            email: email.clone(),
            password_hash,
            name,
            role: Role::User,
        })
        .await?;
    let Some(user) = created else {
        warn!(%email, "email already registered");
        return Err(AppError::Conflict("Email already registered".into()));
    };

    let token = start_session(&state, &user, &ip, &headers).await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            success: true,
            message: "Registration successful".into(),
            token,
            user: PublicUser::from(&user),
        }),
    ))
}

#[instrument(skip(state, headers, payload))]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AppError> {
    let Json(payload) = payload?;
    let (email, password) = required_credentials(payload.email, payload.password)?;

    let Some(user) = state.store.find_user_by_email(&email).await? else {
        verify_dummy(&password);
        warn!(%email, "login unknown email");
        return Err(AppError::InvalidCredentials);
    };

    if !verify_password(&password, &user.password_hash)? {
        warn!(%email, user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    let token = start_session(&state, &user, &ip, &headers).await?;
    state
        .store
        .record_login(user.id, OffsetDateTime::now_utc())
        .await?;

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(Json(AuthResponse {
        success: true,
        message: "Login successful".into(),
        token,
        user: PublicUser::from(&user),
    }))
}

#[instrument(skip(state, auth), fields(user_id = %auth.claims.sub))]
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<MessageResponse>, AppError> {
    state.store.delete_session(&hash_token(&auth.token)).await?;
    info!("user logged out");
    Ok(Json(MessageResponse {
        success: true,
        message: "Logout successful".into(),
    }))
}

#[instrument(skip(state, auth), fields(user_id = %auth.claims.sub))]
pub async fn get_profile(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ProfileResponse>, AppError> {
    let user = state
        .store
        .find_user_by_id(auth.claims.sub)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    Ok(Json(ProfileResponse {
        success: true,
        message: None,
        user,
    }))
}

#[instrument(skip(state, auth, payload), fields(user_id = %auth.claims.sub))]
pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<ProfileResponse>, AppError> {
    let Json(payload) = payload?;
    let name = payload.name.as_deref().map(str::trim).unwrap_or_default();
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(AppError::validation(format!(
            "Name must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }

    let user = state
        .store
        .update_user_name(auth.claims.sub, name)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    info!("profile updated");
    Ok(Json(ProfileResponse {
        success: true,
        message: Some("Profile updated".into()),
        user,
    }))
}
