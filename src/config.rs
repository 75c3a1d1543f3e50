use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub secret: String,
    pub ttl_seconds: i64,
    pub cookie_secure: bool,
}

/// Sliding window parameters for one rate-limited action.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max: i64,
    pub window_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub secret: String,
    pub login: RateLimitRule,
    pub register: RateLimitRule,
    pub api: RateLimitRule,
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt: JwtConfig,
    pub csrf: CsrfConfig,
    pub rate_limit: RateLimitConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn rule_from_env(prefix: &str, max: i64, window_seconds: i64) -> RateLimitRule {
    RateLimitRule {
        max: env_or(&format!("RATE_LIMIT_{prefix}_MAX"), max),
        window_seconds: env_or(&format!("RATE_LIMIT_{prefix}_WINDOW_SECONDS"), window_seconds),
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET is not set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "webapp".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "webapp-users".into()),
            ttl_minutes: env_or("JWT_TTL_MINUTES", 60),
        };
        let csrf = CsrfConfig {
            secret: std::env::var("CSRF_SECRET").context("CSRF_SECRET is not set")?,
            ttl_seconds: env_or("CSRF_TTL_SECONDS", 2 * 60 * 60),
            cookie_secure: env_or("COOKIE_SECURE", false),
        };
        let rate_limit = RateLimitConfig {
            secret: std::env::var("RATE_LIMIT_SECRET").unwrap_or_else(|_| csrf.secret.clone()),
            login: rule_from_env("LOGIN", 5, 300),
            register: rule_from_env("REGISTER", 3, 3600),
            api: rule_from_env("API", 60, 60),
            trust_forwarded_headers: env_or("TRUST_FORWARDED_HEADERS", true),
        };
        Ok(Self {
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            jwt,
            csrf,
            rate_limit,
        })
    }
}
