use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Append-only audit row for a privileged mutation.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AdminLog {
    pub id: i64,
    pub admin_id: Uuid,
    pub action: String,
    pub meta: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
