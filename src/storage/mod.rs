//! Persistence seam. Handlers and middleware talk to `dyn Store`; Postgres
//! implements it in the per-module `repo.rs` files.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    admin::repo_types::AdminLog,
    auth::{
        claims::Role,
        repo_types::{NewSession, NewUser, User},
    },
    config::AppConfig,
    rate_limit::{AttemptOutcome, NewAttempt},
};

#[cfg(test)]
pub mod memory;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    /// Returns `None` when the email is already registered.
    async fn create_user(&self, new: NewUser) -> anyhow::Result<Option<User>>;
    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()>;
    async fn update_user_name(&self, id: Uuid, name: &str) -> anyhow::Result<Option<User>>;
    /// Newest accounts first.
    async fn list_users(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> anyhow::Result<()>;
    /// True when a row for `token_hash` exists and has not expired at `now`.
    async fn session_active(&self, token_hash: &str, now: OffsetDateTime) -> anyhow::Result<bool>;
    /// Returns whether a row was removed.
    async fn delete_session(&self, token_hash: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Counts attempts for the key newer than `window_start` and, when fewer
    /// than `max`, appends `attempt`. Count and append are atomic per key.
    async fn check_and_record(
        &self,
        attempt: NewAttempt,
        window_start: OffsetDateTime,
        max: i64,
    ) -> anyhow::Result<AttemptOutcome>;
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    /// Sets the role and appends a `role_change` audit row in one
    /// transaction. Returns the updated user and the previous role, or `None`
    /// when the user does not exist.
    async fn change_role(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> anyhow::Result<Option<(User, Role)>>;
    /// Most recent first.
    async fn list_admin_logs(&self, limit: i64) -> anyhow::Result<Vec<AdminLog>>;
}

#[async_trait]
pub trait Store: UserStore + SessionStore + AttemptStore + AdminStore {
    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("ping database")?;
        Ok(())
    }
}
