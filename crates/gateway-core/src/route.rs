//! Route definitions and the per-route policies they carry.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// HTTP method a route answers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl HttpMethod {
    /// Uppercase method name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    /// Only GET responses are ever cached
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(GatewayError::validation_field(
                format!("Unsupported HTTP method: {other}"),
                "method",
            )),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(value: HttpMethod) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<&http::Method> for HttpMethod {
    type Error = GatewayError;

    fn try_from(value: &http::Method) -> Result<Self, Self::Error> {
        value.as_str().parse()
    }
}

/// Normalize a request path for matching and cache keys.
///
/// Drops query and fragment, collapses repeated slashes and removes a trailing
/// slash. The result always starts with `/`.
#[must_use]
pub fn normalize_path(raw: &str) -> String {
    let path = raw
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Which identity a rate-limit counter is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    /// Client IP address
    #[default]
    Ip,
    /// Authenticated subject (falls back to IP when anonymous)
    User,
    /// The endpoint itself, shared by all callers
    Endpoint,
    /// One counter for the whole gateway
    Global,
    /// API client (key or token subject), falls back to IP when anonymous
    Client,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "ip"),
            Self::User => write!(f, "user"),
            Self::Endpoint => write!(f, "endpoint"),
            Self::Global => write!(f, "global"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Per-route rate limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    #[serde(alias = "window_secs", alias = "windowSeconds")]
    pub window_seconds: u64,
    /// Counter scope
    #[serde(default)]
    pub scope: RateLimitScope,
}

impl RateLimitPolicy {
    /// Create a new IP-scoped policy
    #[must_use]
    pub fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
            scope: RateLimitScope::Ip,
        }
    }

    /// Set the scope
    #[must_use]
    pub fn with_scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Window as a duration
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Which tiers a route's responses are stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Process-local tier only
    Memory,
    /// Shared tier only
    Shared,
    /// Both tiers
    #[default]
    Tiered,
}

/// Per-route response caching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl", alias = "ttl", alias = "ttlSeconds")]
    pub ttl_seconds: u64,
    /// Tier selection
    #[serde(default)]
    pub strategy: CacheStrategy,
    /// Tags attached to stored entries
    #[serde(default)]
    pub tags: Vec<String>,
    /// Header names that partition the cache; gateway default when unset
    #[serde(default, alias = "varyBy")]
    pub vary_by: Option<Vec<String>>,
}

fn default_cache_ttl() -> u64 {
    3600
}

impl CachePolicy {
    /// Create a tiered policy with the given TTL
    #[must_use]
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            strategy: CacheStrategy::Tiered,
            tags: Vec::new(),
            vary_by: None,
        }
    }

    /// Attach tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the tier strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Override vary-by headers
    #[must_use]
    pub fn with_vary_by(mut self, headers: Vec<String>) -> Self {
        self.vary_by = Some(headers);
        self
    }

    /// TTL as a duration
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Regex rewrite applied to the forwarded path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    /// Regular expression matched against the path
    pub pattern: String,
    /// Replacement, may reference capture groups (`$1`)
    pub replacement: String,
}

impl PathRewrite {
    /// Create a rewrite rule
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// A configured mapping from (path, method) to a backend and its policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier
    pub id: String,
    /// Exact path to match
    pub path: String,
    /// Method to match
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    /// Target backend name
    pub backend: String,
    /// Whether an identity is required
    #[serde(default, alias = "authentication")]
    pub auth_required: bool,
    /// Rate limit, if any
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Response caching, if any
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    /// Headers injected into the forwarded request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Path rewrite rules, applied in order
    #[serde(default)]
    pub path_rewrite: Vec<PathRewrite>,
    /// Strip the route path from the forwarded path when no rewrite rule is set
    #[serde(default)]
    pub strip_prefix: bool,
    /// Higher wins on conflicts
    #[serde(default)]
    pub priority: i32,
    /// Inactive routes never match
    #[serde(default = "default_true", alias = "isActive")]
    pub active: bool,
    /// Upstream time budget, gateway default when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Any one of these roles grants access
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// All of these scopes are needed
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Creation time, used as the secondary tie-break
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    compiled_rewrites: OnceCell<Vec<(Regex, String)>>,
}

fn default_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_true() -> bool {
    true
}

impl Route {
    /// Create an active route with no policies
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        method: HttpMethod,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            method,
            backend: backend.into(),
            auth_required: false,
            rate_limit: None,
            cache: None,
            headers: BTreeMap::new(),
            path_rewrite: Vec::new(),
            strip_prefix: false,
            priority: 0,
            active: true,
            timeout: None,
            required_roles: Vec::new(),
            required_scopes: Vec::new(),
            description: None,
            created_at: Utc::now(),
            compiled_rewrites: OnceCell::new(),
        }
    }

    /// Require authentication
    #[must_use]
    pub fn with_auth(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Set the rate limit
    #[must_use]
    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    /// Set the cache policy
    #[must_use]
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Add an injected header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a rewrite rule
    #[must_use]
    pub fn with_rewrite(mut self, rule: PathRewrite) -> Self {
        self.path_rewrite.push(rule);
        self.compiled_rewrites = OnceCell::new();
        self
    }

    /// Strip the route path from the forwarded path
    #[must_use]
    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the active flag
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Set the upstream timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require any of the given roles
    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.required_roles = roles;
        self
    }

    /// Require all of the given scopes
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.required_scopes = scopes;
        self
    }

    /// Override creation time
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Normalized form of the route path
    #[must_use]
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    /// Whether the route has a cacheable method and a cache policy
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.method.is_cacheable() && self.cache.is_some()
    }

    /// Check rewrite patterns compile
    ///
    /// # Errors
    /// Returns a validation error naming the first invalid pattern
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.backend.trim().is_empty() {
            return Err(GatewayError::validation_field(
                format!("Route '{}' has no backend", self.id),
                "backend",
            ));
        }
        for rule in &self.path_rewrite {
            Regex::new(&rule.pattern).map_err(|e| {
                GatewayError::validation_field(
                    format!("Route '{}' has invalid rewrite '{}': {e}", self.id, rule.pattern),
                    "path_rewrite",
                )
            })?;
        }
        if let Some(policy) = &self.rate_limit {
            if policy.limit == 0 || policy.window_seconds == 0 {
                return Err(GatewayError::validation_field(
                    format!("Route '{}' rate limit must be positive", self.id),
                    "rate_limit",
                ));
            }
        }
        Ok(())
    }

    /// Path to forward upstream after rewrite rules
    #[must_use]
    pub fn rewrite_path(&self, path: &str) -> String {
        if self.path_rewrite.is_empty() {
            if self.strip_prefix {
                let prefix = self.normalized_path();
                let rest = path.strip_prefix(prefix.as_str()).unwrap_or(path);
                return normalize_path(rest);
            }
            return path.to_string();
        }

        let rules = self.compiled_rewrites.get_or_init(|| {
            self.path_rewrite
                .iter()
                .filter_map(|rule| match Regex::new(&rule.pattern) {
                    Ok(re) => Some((re, rule.replacement.clone())),
                    Err(e) => {
                        warn!(route = %self.id, pattern = %rule.pattern, error = %e, "Skipping invalid path rewrite");
                        None
                    }
                })
                .collect()
        });

        let mut rewritten = path.to_string();
        for (re, replacement) in rules {
            rewritten = re.replace(&rewritten, replacement.as_str()).into_owned();
        }
        normalize_path(&rewritten)
    }
}
