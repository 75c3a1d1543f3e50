use serde::{Deserialize, Serialize};

use super::repo_types::AdminLog;
use crate::auth::repo_types::User;

pub const DEFAULT_USER_PAGE: i64 = 50;
pub const MAX_USER_PAGE: i64 = 200;
pub const DEFAULT_LOG_LIMIT: i64 = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListUsersQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListUsersQuery {
    /// Clamped `(limit, offset)`.
    pub fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_USER_PAGE).clamp(1, MAX_USER_PAGE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListLogsQuery {
    pub limit: Option<i64>,
}

impl ListLogsQuery {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, DEFAULT_LOG_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateRoleRequest {
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub success: bool,
    pub users: Vec<User>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub success: bool,
    pub message: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub success: bool,
    pub logs: Vec<AdminLog>,
}
