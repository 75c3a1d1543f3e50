use anyhow::Context;
use async_trait::async_trait;
use time::OffsetDateTime;

use super::{AttemptOutcome, NewAttempt};
use crate::storage::{AttemptStore, PgStore};

#[async_trait]
impl AttemptStore for PgStore {
    async fn check_and_record(
        &self,
        attempt: NewAttempt,
        window_start: OffsetDateTime,
        max: i64,
    ) -> anyhow::Result<AttemptOutcome> {
        let mut tx = self.pool.begin().await.context("begin rate limit tx")?;

        // Serializes concurrent requests for the same key until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&attempt.key_hash)
            .execute(&mut *tx)
            .await
            .context("lock rate limit key")?;

        sqlx::query(
            r#"
            DELETE FROM rate_limit_attempts
            WHERE action = $1 AND key_hash = $2 AND created_at <= $3
            "#,
        )
        .bind(attempt.action.as_str())
        .bind(&attempt.key_hash)
        .bind(window_start)
        .execute(&mut *tx)
        .await
        .context("prune rate limit attempts")?;

        let (count, earliest): (i64, Option<OffsetDateTime>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM rate_limit_attempts
            WHERE action = $1 AND key_hash = $2 AND created_at > $3
            "#,
        )
        .bind(attempt.action.as_str())
        .bind(&attempt.key_hash)
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await
        .context("count rate limit attempts")?;

        if count >= max {
            tx.commit().await.context("commit rate limit tx")?;
            return Ok(AttemptOutcome::Limited {
                earliest: earliest.unwrap_or(attempt.created_at),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO rate_limit_attempts (action, key_hash, ip, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(attempt.action.as_str())
        .bind(&attempt.key_hash)
        .bind(&attempt.ip)
        .bind(attempt.created_at)
        .execute(&mut *tx)
        .await
        .context("insert rate limit attempt")?;

        tx.commit().await.context("commit rate limit tx")?;
        Ok(AttemptOutcome::Recorded)
    }
}
