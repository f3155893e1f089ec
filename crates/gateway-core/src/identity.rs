//! Caller identity produced by authentication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credential kind an identity was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Signed bearer token
    Token,
    /// Opaque API key
    ApiKey,
}

/// Authenticated caller, built fresh for each request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject (user or key owner id)
    pub subject: String,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Credential kind
    pub source: IdentitySource,
    /// Credential expiry, if any
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Create an identity with no roles or scopes
    pub fn new(subject: impl Into<String>, source: IdentitySource) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
            scopes: Vec::new(),
            source,
            expires_at: None,
        }
    }

    /// Set roles
    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Set scopes
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set expiry
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when `required` is empty or the identity holds at least one of them
    #[must_use]
    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|r| self.roles.contains(r))
    }

    /// True when the identity holds every scope in `required`
    #[must_use]
    pub fn has_all_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|s| self.scopes.contains(s))
    }
}
