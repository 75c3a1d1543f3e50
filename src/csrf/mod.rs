//! Double-submit CSRF protection.
//!
//! `CSRF-TOKEN` carries the plain token and is readable by page scripts,
//! which echo it in `X-CSRF-Token`. `CSRF-TOKEN-SIGNED` is HttpOnly and
//! carries `expiry|hex(HMAC-SHA256(secret, token|expiry))`.

use axum::http::{header::COOKIE, HeaderMap, HeaderValue};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::CsrfConfig;

pub mod middleware;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const TOKEN_COOKIE: &str = "CSRF-TOKEN";
pub const SIGNED_COOKIE: &str = "CSRF-TOKEN-SIGNED";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CsrfError {
    #[error("CSRF token missing")]
    Missing,
    #[error("Invalid CSRF token")]
    Mismatch,
    #[error("CSRF token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expiry: i64,
    pub signature: String,
}

impl IssuedToken {
    pub fn signed_value(&self) -> String {
        format!("{}|{}", self.expiry, self.signature)
    }
}

#[derive(Clone)]
pub struct CsrfGuard {
    secret: Vec<u8>,
    ttl_seconds: i64,
    cookie_secure: bool,
}

impl CsrfGuard {
    pub fn new(cfg: &CsrfConfig) -> Self {
        Self {
            secret: cfg.secret.as_bytes().to_vec(),
            ttl_seconds: cfg.ttl_seconds,
            cookie_secure: cfg.cookie_secure,
        }
    }

    fn sign(&self, token: &str, expiry: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(token.as_bytes());
        mac.update(b"|");
        mac.update(expiry.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn issue_at(&self, now: i64) -> IssuedToken {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let expiry = now + self.ttl_seconds;
        let signature = self.sign(&token, expiry);
        IssuedToken {
            token,
            expiry,
            signature,
        }
    }

    pub fn issue(&self) -> IssuedToken {
        self.issue_at(OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Checks the header token against both cookies. Reuse within the TTL is
    /// allowed.
    pub fn verify_at(
        &self,
        header_token: Option<&str>,
        cookie_token: Option<&str>,
        signed_cookie: Option<&str>,
        now: i64,
    ) -> Result<(), CsrfError> {
        let header_token = header_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CsrfError::Missing)?;
        let cookie_token = cookie_token.ok_or(CsrfError::Missing)?;
        let (expiry, signature) = signed_cookie
            .and_then(|v| v.split_once('|'))
            .and_then(|(exp, sig)| Some((exp.parse::<i64>().ok()?, sig)))
            .ok_or(CsrfError::Missing)?;

        if !bool::from(header_token.as_bytes().ct_eq(cookie_token.as_bytes())) {
            return Err(CsrfError::Mismatch);
        }
        let expected = self.sign(header_token, expiry);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(CsrfError::Mismatch);
        }
        if expiry < now {
            return Err(CsrfError::Expired);
        }
        Ok(())
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), CsrfError> {
        self.verify_at(
            headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()),
            cookie_value(headers, TOKEN_COOKIE),
            cookie_value(headers, SIGNED_COOKIE),
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    /// `Set-Cookie` values for a freshly issued pair.
    pub fn set_cookies(&self, issued: &IssuedToken) -> anyhow::Result<[HeaderValue; 2]> {
        let mut attrs = format!("Path=/; SameSite=Lax; Max-Age={}", self.ttl_seconds);
        if self.cookie_secure {
            attrs.push_str("; Secure");
        }
        let plain = format!("{TOKEN_COOKIE}={}; {attrs}", issued.token);
        let signed = format!("{SIGNED_COOKIE}={}; {attrs}; HttpOnly", issued.signed_value());
        Ok([HeaderValue::from_str(&plain)?, HeaderValue::from_str(&signed)?])
    }
}

/// Value of a request cookie, looking across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
}
