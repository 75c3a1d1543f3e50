//! In-process `Store` for router and middleware tests.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Mutex,
};

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AdminStore, AttemptStore, SessionStore, Store, UserStore};
use crate::{
    admin::repo_types::AdminLog,
    auth::{
        claims::Role,
        repo_types::{NewSession, NewUser, User},
    },
    rate_limit::{AttemptOutcome, NewAttempt},
};

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<Vec<User>>,
    sessions: Mutex<Vec<NewSession>>,
    attempts: Mutex<Vec<NewAttempt>>,
    logs: Mutex<Vec<AdminLog>>,
    next_log_id: AtomicI64,
    unhealthy: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn set_role(&self, email: &str, role: Role) {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.email == email) {
            user.role = role;
        }
    }

    pub fn set_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn create_user(&self, new: NewUser) -> anyhow::Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| u.email == new.email) {
            return Ok(None);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            name: new.name,
            role: new.role,
            created_at: OffsetDateTime::now_utc(),
            last_login: None,
        };
        users.push(user.clone());
        Ok(Some(user))
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.last_login = Some(at);
        }
        Ok(())
    }

    async fn update_user_name(&self, id: Uuid, name: &str) -> anyhow::Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        Ok(users.iter_mut().find(|u| u.id == id).map(|user| {
            user.name = name.to_string();
            user.clone()
        }))
    }

    async fn list_users(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<User>> {
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|s| s.expires_at > now);
        sessions.push(new);
        Ok(())
    }

    async fn session_active(&self, token_hash: &str, now: OffsetDateTime) -> anyhow::Result<bool> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .iter()
            .any(|s| s.token_hash == token_hash && s.expires_at > now))
    }

    async fn delete_session(&self, token_hash: &str) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.token_hash != token_hash);
        Ok(sessions.len() != before)
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn check_and_record(
        &self,
        attempt: NewAttempt,
        window_start: OffsetDateTime,
        max: i64,
    ) -> anyhow::Result<AttemptOutcome> {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.retain(|a| {
            a.action != attempt.action
                || a.key_hash != attempt.key_hash
                || a.created_at > window_start
        });
        let in_window = attempts.iter().filter(|a| {
            a.action == attempt.action
                && a.key_hash == attempt.key_hash
                && a.created_at > window_start
        });
        let (count, earliest) = in_window.fold((0i64, None), |(n, min), a| {
            let min = match min {
                Some(m) if m <= a.created_at => Some(m),
                _ => Some(a.created_at),
            };
            (n + 1, min)
        });
        if count >= max {
            return Ok(AttemptOutcome::Limited {
                earliest: earliest.unwrap_or(attempt.created_at),
            });
        }
        attempts.push(attempt);
        Ok(AttemptOutcome::Recorded)
    }
}

#[async_trait]
impl AdminStore for MemoryStore {
    async fn change_role(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> anyhow::Result<Option<(User, Role)>> {
        let mut users = self.users.lock().unwrap();
        let Some(user) = users.iter_mut().find(|u| u.id == user_id) else {
            return Ok(None);
        };
        let previous = user.role;
        user.role = role;
        let updated = user.clone();
        drop(users);

        self.sessions.lock().unwrap().retain(|s| s.user_id != user_id);

        self.logs.lock().unwrap().push(AdminLog {
            id: self.next_log_id.fetch_add(1, Ordering::SeqCst) + 1,
            admin_id,
            action: "role_change".into(),
            meta: json!({
                "user_id": user_id,
                "role": role.as_str(),
                "previous_role": previous.as_str(),
            }),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(Some((updated, previous)))
    }

    async fn list_admin_logs(&self, limit: i64) -> anyhow::Result<Vec<AdminLog>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            anyhow::bail!("store marked unhealthy");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn session(token_hash: &str, expires_at: OffsetDateTime) -> NewSession {
        NewSession {
            user_id: Uuid::new_v4(),
            token_hash: token_hash.into(),
            ip_address: "ip".into(),
            user_agent: "ua".into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned_on_insert() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        store.create_session(session("old", now - Duration::minutes(1))).await.unwrap();
        store.create_session(session("live", now + Duration::hours(1))).await.unwrap();
        store.create_session(session("new", now + Duration::hours(1))).await.unwrap();
        assert_eq!(store.session_count(), 2);
        assert!(store.session_active("live", now).await.unwrap());
    }
}
