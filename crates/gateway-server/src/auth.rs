//! # Credential Authentication
//!
//! Turns whatever credential a request carries into an [`Identity`]:
//! - HS256 bearer tokens (`Authorization: Bearer`), verified for signature and expiry
//! - Opaque API keys, verified against a [`CredentialStore`]
//!
//! Extraction order, first match wins: `Authorization: Bearer <t>`, the
//! `x-api-key` header, the `token` query parameter, the `token` cookie. A
//! credential with exactly three dot-separated segments is treated as a
//! signed token; anything else is an API key.
//!
//! A request without a credential is [`AuthOutcome::Anonymous`]. Whether that
//! is acceptable is decided by the route, not here.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gateway_server::auth::{Authenticator, InMemoryCredentialStore};
//!
//! let auth = Authenticator::new(Some("secret"), Arc::new(InMemoryCredentialStore::new()));
//! let token = auth.issue(&identity)?;
//! ```

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_config::{ApiKeySettings, AuthSettings};
use gateway_core::{GatewayError, Identity, IdentitySource, Route};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying an API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter and cookie name carrying a credential
pub const TOKEN_PARAM: &str = "token";

/// Role granted to every API-key identity
pub const API_KEY_ROLE: &str = "api";

/// Token kind, carried in the `token_type` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived token presented on requests
    #[default]
    Access,
    /// Long-lived token exchanged for access tokens
    Refresh,
}

/// Signed token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Issued at, seconds since epoch
    pub iat: i64,
    /// Token kind
    #[serde(default)]
    pub token_type: TokenType,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    fn into_identity(self) -> Identity {
        let mut identity = Identity::new(self.sub, IdentitySource::Token)
            .with_roles(self.roles)
            .with_scopes(self.scopes);
        if let Some(expires_at) = DateTime::from_timestamp(self.exp, 0) {
            identity = identity.with_expiry(expires_at);
        }
        identity
    }
}

/// Stored API key metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Owning subject
    pub owner: String,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Disabled keys never verify
    pub active: bool,
    /// Expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Successful verifications so far
    pub usage_count: u64,
    /// Last successful verification
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Active key with no scopes and no expiry
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            scopes: Vec::new(),
            active: true,
            expires_at: None,
            usage_count: 0,
            last_used_at: None,
        }
    }

    /// Set scopes
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set expiry
    #[must_use]
    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    fn into_identity(self) -> Identity {
        let mut identity = Identity::new(self.owner, IdentitySource::ApiKey)
            .with_roles(vec![API_KEY_ROLE.to_string()])
            .with_scopes(self.scopes);
        if let Some(expires_at) = self.expires_at {
            identity = identity.with_expiry(expires_at);
        }
        identity
    }
}

/// Stored user, as far as token verification cares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id, matched against the token subject
    pub id: String,
    /// Inactive users are rejected even with a valid token
    pub active: bool,
}

/// Source of API keys and users
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a raw API key, counting the use when it verifies
    ///
    /// Returns `Ok(None)` for unknown or disabled keys.
    async fn verify_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, AuthError>;

    /// Look up a user by id
    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, AuthError>;
}

/// Hash an API key for storage and lookup
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Credential store held in process memory; keys are stored hashed
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    keys: DashMap<String, ApiKeyRecord>,
    users: DashMap<String, UserRecord>,
}

impl InMemoryCredentialStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from configuration
    #[must_use]
    pub fn from_settings(keys: &[ApiKeySettings]) -> Self {
        let store = Self::new();
        for settings in keys {
            let mut record = ApiKeyRecord::new(settings.owner.clone())
                .with_scopes(settings.scopes.clone())
                .with_active(settings.active);
            record.expires_at = settings.expires_at;
            store.add_key(settings.key.expose_secret(), record);
        }
        if !keys.is_empty() {
            info!(keys = keys.len(), "Loaded API keys");
        }
        store
    }

    /// Register a raw key
    pub fn add_key(&self, key: &str, record: ApiKeyRecord) {
        self.keys.insert(hash_api_key(key), record);
    }

    /// Register a user
    pub fn add_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    /// Current record for a raw key
    #[must_use]
    pub fn key_record(&self, key: &str) -> Option<ApiKeyRecord> {
        self.keys.get(&hash_api_key(key)).map(|r| r.value().clone())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn verify_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, AuthError> {
        let Some(mut record) = self.keys.get_mut(&hash_api_key(key)) else {
            return Ok(None);
        };
        if !record.active {
            return Ok(None);
        }
        if record.is_expired() {
            return Err(AuthError::ExpiredCredential);
        }
        record.usage_count += 1;
        record.last_used_at = Some(Utc::now());
        Ok(Some(record.clone()))
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, AuthError> {
        Ok(self.users.get(id).map(|u| u.value().clone()))
    }
}

/// Result of authenticating a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A credential verified
    Authenticated(Identity),
    /// No credential was presented
    Anonymous,
}

impl AuthOutcome {
    /// Identity, if authenticated
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::Anonymous => None,
        }
    }

    /// Take the identity, if authenticated
    #[must_use]
    pub fn into_identity(self) -> Option<Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::Anonymous => None,
        }
    }
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Verifies credentials and issues tokens
pub struct Authenticator {
    keys: Option<SigningKeys>,
    store: Arc<dyn CredentialStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    leeway: u64,
    issuer: Option<String>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("tokens_enabled", &self.keys.is_some())
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("leeway", &self.leeway)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create an authenticator; without a secret only API keys verify
    pub fn new(secret: Option<&str>, store: Arc<dyn CredentialStore>) -> Self {
        let defaults = AuthSettings::default();
        Self {
            keys: secret.filter(|s| !s.is_empty()).map(|s| SigningKeys {
                encoding: EncodingKey::from_secret(s.as_bytes()),
                decoding: DecodingKey::from_secret(s.as_bytes()),
            }),
            store,
            access_ttl: defaults.access_token_ttl,
            refresh_ttl: defaults.refresh_token_ttl,
            leeway: defaults.leeway_seconds,
            issuer: defaults.issuer,
        }
    }

    /// Create an authenticator from configuration
    pub fn from_settings(settings: &AuthSettings, store: Arc<dyn CredentialStore>) -> Self {
        let mut auth = Self::new(settings.secret(), store)
            .with_access_ttl(settings.access_token_ttl)
            .with_refresh_ttl(settings.refresh_token_ttl)
            .with_leeway(settings.leeway_seconds);
        auth.issuer.clone_from(&settings.issuer);
        auth
    }

    /// Set access token lifetime
    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    /// Set refresh token lifetime
    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// Set tolerated clock skew, in seconds
    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.leeway = seconds;
        self
    }

    /// Require and stamp an `iss` claim
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Whether signed tokens can be verified and issued
    #[must_use]
    pub fn tokens_enabled(&self) -> bool {
        self.keys.is_some()
    }

    /// Authenticate the credential carried by a request, if any
    ///
    /// # Errors
    /// Returns an error when a credential is present but does not verify
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        let Some(credential) = extract_credential(headers, query) else {
            return Ok(AuthOutcome::Anonymous);
        };

        let identity = if is_signed_token(&credential) {
            let identity = self.verify_token(&credential, TokenType::Access)?;
            self.check_user(&identity).await?;
            identity
        } else {
            self.verify_api_key(&credential).await?
        };

        debug!(subject = %identity.subject, source = ?identity.source, "Authenticated request");
        Ok(AuthOutcome::Authenticated(identity))
    }

    /// Check an identity against a route's role and scope requirements
    ///
    /// Roles are any-of, scopes are all-of.
    ///
    /// # Errors
    /// Returns `MissingCredentials` without an identity, or an insufficient
    /// role/scope error
    pub fn authorize(identity: Option<&Identity>, route: &Route) -> Result<(), AuthError> {
        let needs_identity = route.auth_required
            || !route.required_roles.is_empty()
            || !route.required_scopes.is_empty();
        let Some(identity) = identity else {
            return if needs_identity {
                Err(AuthError::MissingCredentials)
            } else {
                Ok(())
            };
        };

        if !route.required_roles.is_empty() && !identity.has_any_role(&route.required_roles) {
            return Err(AuthError::InsufficientRole(route.required_roles.join(", ")));
        }
        if !identity.has_all_scopes(&route.required_scopes) {
            return Err(AuthError::InsufficientScope(route.required_scopes.join(" ")));
        }
        Ok(())
    }

    /// Issue an access token
    ///
    /// # Errors
    /// Returns an error when no secret is configured or signing fails
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        self.sign(identity, TokenType::Access, self.access_ttl)
    }

    /// Issue a refresh token
    ///
    /// # Errors
    /// Returns an error when no secret is configured or signing fails
    pub fn issue_refresh(&self, identity: &Identity) -> Result<String, AuthError> {
        self.sign(identity, TokenType::Refresh, self.refresh_ttl)
    }

    /// Exchange a refresh token for a new access token
    ///
    /// # Errors
    /// Returns `InvalidToken` for access tokens or tokens that do not verify
    pub fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let identity = self.verify_token(refresh_token, TokenType::Refresh)?;
        self.issue(&identity)
    }

    /// Verify a signed token of the expected kind
    ///
    /// # Errors
    /// Returns `InvalidToken` or `ExpiredCredential`
    pub fn verify_token(&self, token: &str, expected: TokenType) -> Result<Identity, AuthError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("token verification is not configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let claims = decode::<Claims>(token, &keys.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "Token validation failed");
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::ExpiredCredential,
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?
            .claims;

        if claims.token_type != expected {
            return Err(AuthError::InvalidToken(format!(
                "expected {expected:?} token, got {:?}",
                claims.token_type
            )));
        }
        Ok(claims.into_identity())
    }

    async fn verify_api_key(&self, key: &str) -> Result<Identity, AuthError> {
        match self.store.verify_api_key(key).await? {
            Some(record) => Ok(record.into_identity()),
            None => Err(AuthError::InvalidApiKey),
        }
    }

    async fn check_user(&self, identity: &Identity) -> Result<(), AuthError> {
        match self.store.find_user_by_id(&identity.subject).await? {
            Some(user) if !user.active => {
                warn!(subject = %identity.subject, "Token presented for inactive user");
                Err(AuthError::InvalidToken("user is inactive".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn sign(&self, identity: &Identity, token_type: TokenType, ttl: Duration) -> Result<String, AuthError> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| AuthError::Configuration("JWT secret not configured".to_string()))?;
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: identity.subject.clone(),
            roles: identity.roles.clone(),
            scopes: identity.scopes.clone(),
            exp: now.saturating_add(ttl),
            iat: now,
            token_type,
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| AuthError::Configuration(format!("token signing failed: {e}")))
    }
}

/// Token from an `Authorization` value; the scheme is case-insensitive
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim_start().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
}

/// Find the request's credential, in precedence order
#[must_use]
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    if let Some(token) = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, v)| k == TOKEN_PARAM && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    }) {
        return Some(token);
    }

    CookieJar::from_headers(headers)
        .get(TOKEN_PARAM)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

fn is_signed_token(credential: &str) -> bool {
    credential.split('.').count() == 3
}

/// Authentication error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Route needs an identity and none was presented
    #[error("Authentication required")]
    MissingCredentials,

    /// Signed token failed verification
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Unknown or disabled API key
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Token or key past its expiry
    #[error("Credentials expired")]
    ExpiredCredential,

    /// Identity has none of the required roles
    #[error("Insufficient role, one of: {0}")]
    InsufficientRole(String),

    /// Identity lacks a required scope
    #[error("Insufficient scope: {0}")]
    InsufficientScope(String),

    /// Credential store failure
    #[error("Credential store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Get HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredentials
            | Self::InvalidToken(_)
            | Self::InvalidApiKey
            | Self::ExpiredCredential => StatusCode::UNAUTHORIZED,
            Self::InsufficientRole(_) | Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::Store(_) | Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for API response
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "authentication_required",
            Self::InvalidToken(_) => "invalid_token",
            Self::InvalidApiKey => "invalid_api_key",
            Self::ExpiredCredential => "expired_credentials",
            Self::InsufficientRole(_) => "insufficient_role",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::Store(_) => "credential_store_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials => Self::authentication("Authentication required"),
            AuthError::InvalidToken(_) | AuthError::InvalidApiKey | AuthError::ExpiredCredential => {
                Self::authentication("Invalid token")
            }
            AuthError::InsufficientRole(_) => Self::authorization("Insufficient permissions"),
            AuthError::InsufficientScope(_) => Self::authorization("Insufficient scopes"),
            AuthError::Store(message) | AuthError::Configuration(message) => Self::internal(message),
        }
    }
}
