use super::{
    claims::{Claims, Role},
    extractors::AuthUser,
    jwt::TokenError,
};
use crate::error::AppError;

/// Routes of the admin panel.
pub const ADMIN: &[Role] = &[Role::Admin, Role::SuperAdmin];
/// Role assignment and audit log access.
pub const SUPER_ADMIN: &[Role] = &[Role::SuperAdmin];

/// Checks the caller's role against an explicit allow-list.
pub fn authorize(claims: Option<&Claims>, allowed: &[Role]) -> Result<(), AppError> {
    let claims = claims.ok_or(AppError::Unauthorized(TokenError::Missing))?;
    if allowed.contains(&claims.role) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Insufficient permissions".into()))
    }
}

impl AuthUser {
    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        authorize(Some(&self.claims), allowed)
    }
}
