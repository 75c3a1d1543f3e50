use axum::{
    routing::{get, put},
    Router,
};

use crate::state::AppState;

pub mod dto;
pub mod handlers;
mod repo;
pub mod repo_types;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(handlers::list_users))
        .route("/admin/users/:id/role", put(handlers::update_role))
        .route("/admin/logs", get(handlers::list_logs))
}
