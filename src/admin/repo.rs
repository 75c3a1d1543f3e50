use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::repo_types::AdminLog;
use crate::{
    auth::{claims::Role, repo_types::User},
    storage::{AdminStore, PgStore},
};

#[async_trait]
impl AdminStore for PgStore {
    async fn change_role(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> anyhow::Result<Option<(User, Role)>> {
        let mut tx = self.pool.begin().await.context("begin role change tx")?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT role FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .context("lock user row")?;
        let Some(previous) = previous else {
            tx.rollback().await.context("rollback role change tx")?;
            return Ok(None);
        };
        let previous: Role = previous.parse().context("stored role")?;

        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET role = $2
            WHERE id = $1
            RETURNING id, email, password_hash, name, role, created_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(role.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("update role")?;

        sqlx::query(
            r#"
            INSERT INTO admin_logs (admin_id, action, meta)
            VALUES ($1, 'role_change', $2)
            "#,
        )
        .bind(admin_id)
        .bind(json!({
            "user_id": user_id,
            "role": role.as_str(),
            "previous_role": previous.as_str(),
        }))
        .execute(&mut *tx)
        .await
        .context("insert admin log")?;

        // Tokens carry the role at issuance; drop them so the new role applies
        // on the next login.
        sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("revoke sessions after role change")?;

        tx.commit().await.context("commit role change tx")?;
        Ok(Some((user, previous)))
    }

    async fn list_admin_logs(&self, limit: i64) -> anyhow::Result<Vec<AdminLog>> {
        let logs = sqlx::query_as::<_, AdminLog>(
            r#"
            SELECT id, admin_id, action, meta, created_at
            FROM admin_logs
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list admin logs")?;
        Ok(logs)
    }
}
