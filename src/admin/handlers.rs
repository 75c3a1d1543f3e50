use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::{
    ListLogsQuery, ListUsersQuery, LogsResponse, UpdateRoleRequest, UserResponse, UsersResponse,
};
use crate::{
    auth::{
        claims::Role,
        extractors::AuthUser,
        roles::{ADMIN, SUPER_ADMIN},
    },
    error::AppError,
    state::AppState,
    storage::{AdminStore, UserStore},
};

#[instrument(skip(state, auth, query), fields(admin_id = %auth.claims.sub))]
pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
    query: Result<Query<ListUsersQuery>, QueryRejection>,
) -> Result<Json<UsersResponse>, AppError> {
    auth.require(ADMIN)?;
    let Query(query) = query?;
    let (limit, offset) = query.page();
    let users = state.store.list_users(limit, offset).await?;
    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

#[instrument(skip(state, auth, user_id, payload), fields(admin_id = %auth.claims.sub))]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    user_id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateRoleRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    auth.require(SUPER_ADMIN)?;
    let Path(user_id) = user_id.map_err(|_| AppError::validation("Invalid user id"))?;
    let Json(payload) = payload?;

    let role: Role = payload
        .role
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| AppError::validation("Invalid role"))?;

    let Some((user, previous)) = state
        .store
        .change_role(auth.claims.sub, user_id, role)
        .await?
    else {
        warn!(%user_id, "role change for unknown user");
        return Err(AppError::NotFound("User not found".into()));
    };

    info!(%user_id, %role, previous_role = %previous, "role changed");
    Ok(Json(UserResponse {
        success: true,
        message: "Role updated".into(),
        user,
    }))
}

#[instrument(skip(state, auth, query), fields(admin_id = %auth.claims.sub))]
pub async fn list_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    query: Result<Query<ListLogsQuery>, QueryRejection>,
) -> Result<Json<LogsResponse>, AppError> {
    auth.require(SUPER_ADMIN)?;
    let Query(query) = query?;
    let logs = state.store.list_admin_logs(query.limit()).await?;
    Ok(Json(LogsResponse {
        success: true,
        logs,
    }))
}
