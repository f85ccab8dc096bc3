//! Handshake credential validation seam.
//!
//! Identity is an external collaborator; the push layer needs only this
//! narrow interface. The credential is validated once at handshake and
//! the derived identity is cached on the connection record; expiry is
//! enforced at the next heartbeat boundary.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Identity derived from a validated credential.
#[derive(Debug, Clone)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
    /// When the credential stops being honored. `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Credential validation error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential expired")]
    Expired,

    #[error("missing credential")]
    MissingCredential,
}

/// Validates a handshake credential and derives the tenant identity.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Token-table validator for wiring and tests.
///
/// Production identity lives outside this system; this implementation
/// maps opaque tokens to identities.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }
}

impl CredentialValidator for StaticTokenValidator {
    fn validate(&self, credential: &str) -> Result<Identity, AuthError> {
        let identity = self
            .tokens
            .get(credential)
            .ok_or(AuthError::InvalidCredential)?;

        if identity.expired(Utc::now()) {
            return Err(AuthError::Expired);
        }

        Ok(identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_known_token() {
        let validator =
            StaticTokenValidator::new().with_token("tok-1", Identity::new("t1", "u1"));

        let identity = validator.validate("tok-1").unwrap();
        assert_eq!(identity.tenant_id, "t1");
        assert_eq!(identity.user_id, "u1");
    }

    #[test]
    fn test_validate_unknown_token() {
        let validator = StaticTokenValidator::new();
        assert_eq!(
            validator.validate("nope").unwrap_err(),
            AuthError::InvalidCredential
        );
    }

    #[test]
    fn test_validate_expired_token() {
        let mut identity = Identity::new("t1", "u1");
        identity.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let validator = StaticTokenValidator::new().with_token("tok-1", identity);

        assert_eq!(validator.validate("tok-1").unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_identity_expiry() {
        let now = Utc::now();
        let mut identity = Identity::new("t1", "u1");
        assert!(!identity.expired(now));

        identity.expires_at = Some(now + chrono::Duration::minutes(5));
        assert!(!identity.expired(now));
        assert!(identity.expired(now + chrono::Duration::minutes(6)));
    }
}
