use anyhow::Context;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::repo_types::{NewSession, NewUser, User},
    storage::{PgStore, SessionStore, UserStore},
};

#[async_trait]
impl UserStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, name, role, created_at, last_login
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, name, role, created_at, last_login
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create_user(&self, new: NewUser) -> anyhow::Result<Option<User>> {
        // ON CONFLICT keeps concurrent registrations of one email from racing
        // past the uniqueness check.
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash, name, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING id, email, password_hash, name, role, created_at, last_login
            "#,
        )
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.name)
        .bind(new.role.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("insert user")?;
        Ok(user)
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET last_login = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("update last_login")?;
        Ok(())
    }

    async fn update_user_name(&self, id: Uuid, name: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET name = $2
            WHERE id = $1
            RETURNING id, email, password_hash, name, role, created_at, last_login
            "#,
        )
        .bind(id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("update user name")?;
        Ok(user)
    }

    async fn list_users(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, name, role, created_at, last_login
            FROM users
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("list users")?;
        Ok(users)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, new: NewSession) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .context("prune expired sessions")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, token_hash, ip_address, user_agent, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(new.user_id)
        .bind(&new.token_hash)
        .bind(&new.ip_address)
        .bind(&new.user_agent)
        .bind(new.expires_at)
        .execute(&self.pool)
        .await
        .context("insert session")?;
        Ok(())
    }

    async fn session_active(&self, token_hash: &str, now: OffsetDateTime) -> anyhow::Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM sessions WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("lookup session")?;
        Ok(found.is_some())
    }

    async fn delete_session(&self, token_hash: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .context("delete session")?;
        Ok(res.rows_affected() > 0)
    }
}
