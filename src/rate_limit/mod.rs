//! Sliding window rate limiting backed by the `rate_limit_attempts` table.
//!
//! Every instance shares the same table, so limits hold across horizontally
//! scaled deployments. An allowed attempt is recorded before the request is
//! forwarded; the attempt that reaches `max` therefore counts against the
//! next caller. Rejected attempts are not recorded.

use std::{convert::Infallible, fmt, net::SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap, Method},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    config::{RateLimitConfig, RateLimitRule},
    error::AppError,
    state::AppState,
    storage::AttemptStore,
};

pub mod middleware;
mod repo;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Register,
    ApiMutation,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::ApiMutation => "api_mutation",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the limit that applies to a request, if any.
pub fn classify(method: &Method, path: &str) -> Option<RateLimitAction> {
    let mutating = matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if !mutating || !path.starts_with("/api/") {
        return None;
    }
    let path = path.trim_end_matches('/');
    Some(match (method, path) {
        (&Method::POST, "/api/auth/login" | "/api/login") => RateLimitAction::Login,
        (&Method::POST, "/api/auth/register" | "/api/register") => RateLimitAction::Register,
        _ => RateLimitAction::ApiMutation,
    })
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub action: RateLimitAction,
    pub key_hash: String,
    pub ip: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Recorded,
    Limited { earliest: OffsetDateTime },
}

#[derive(Clone)]
pub struct RateLimiter {
    secret: Vec<u8>,
    login: RateLimitRule,
    register: RateLimitRule,
    api: RateLimitRule,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            secret: cfg.secret.as_bytes().to_vec(),
            login: cfg.login,
            register: cfg.register,
            api: cfg.api,
        }
    }

    pub fn rule(&self, action: RateLimitAction) -> RateLimitRule {
        match action {
            RateLimitAction::Login => self.login,
            RateLimitAction::Register => self.register,
            RateLimitAction::ApiMutation => self.api,
        }
    }

    /// HMAC of `action:ip`, so raw addresses are not the lookup key.
    pub fn key_hash(&self, action: RateLimitAction, ip: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(action.as_str().as_bytes());
        mac.update(b":");
        mac.update(ip.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub async fn check<S: AttemptStore + ?Sized>(
        &self,
        store: &S,
        action: RateLimitAction,
        ip: &str,
    ) -> Result<(), AppError> {
        self.check_at(store, action, ip, OffsetDateTime::now_utc())
            .await
    }

    /// Rejects with `RateLimited` once `max` attempts exist in the trailing
    /// window, otherwise records this attempt.
    pub async fn check_at<S: AttemptStore + ?Sized>(
        &self,
        store: &S,
        action: RateLimitAction,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<(), AppError> {
        let rule = self.rule(action);
        let window_start = now - TimeDuration::seconds(rule.window_seconds);
        let attempt = NewAttempt {
            action,
            key_hash: self.key_hash(action, ip),
            ip: ip.to_string(),
            created_at: now,
        };
        match store.check_and_record(attempt, window_start, rule.max).await? {
            AttemptOutcome::Recorded => {
                debug!(%action, %ip, "rate limit attempt recorded");
                Ok(())
            }
            AttemptOutcome::Limited { earliest } => {
                let retry_after = retry_after(rule.window_seconds, now, earliest);
                warn!(%action, %ip, retry_after, "rate limit exceeded");
                Err(AppError::RateLimited { retry_after })
            }
        }
    }
}

/// Seconds until the earliest attempt leaves the window, at least 1.
pub fn retry_after(window_seconds: i64, now: OffsetDateTime, earliest: OffsetDateTime) -> u64 {
    let elapsed = (now - earliest).whole_seconds();
    (window_seconds - elapsed).max(1) as u64
}

const FORWARDING_HEADERS: [&str; 6] = [
    "cf-connecting-ip",
    "x-client-ip",
    "x-forwarded-for",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Best-effort client address. Forwarding headers are client-controlled and
/// spoofable unless a trusted proxy overwrites them; `trust_forwarded`
/// disables them entirely.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded {
        for name in FORWARDING_HEADERS {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if let Some(ip) = first_hop(value) {
                return ip;
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// First entry of a comma separated list; understands the `for=` form of
/// RFC 7239 `Forwarded`.
fn first_hop(value: &str) -> Option<String> {
    let first = value.split(',').next()?.trim();
    let candidate = first
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            part.get(..4)
                .filter(|p| p.eq_ignore_ascii_case("for="))
                .map(|_| &part[4..])
        })
        .unwrap_or(first);
    let candidate = strip_port(candidate.trim().trim_matches('"'));
    (!candidate.is_empty()).then(|| candidate.to_string())
}

/// `[v6]:port` becomes `v6` and `v4:port` becomes `v4`; bare addresses are
/// returned as is.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(ip, _)| ip);
    }
    match addr.split_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Resolved client address for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

#[async_trait]
impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(resolve_client_ip(
            &parts.headers,
            peer,
            state.config.rate_limit.trust_forwarded_headers,
        )))
    }
}
