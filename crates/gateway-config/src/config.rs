//! Gateway configuration structures.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use gateway_core::{RateLimitPolicy, RateLimitScope, Route};
use gateway_resilience::{CircuitBreakerConfig, FailurePolicy, ResponseCacheConfig};
use gateway_routing::{BalancingAlgorithm, HealthProberConfig, DEFAULT_HEALTH_PATH};
use gateway_telemetry::{LoggingConfig, TracingConfig};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development, full error detail
    #[default]
    Development,
    /// Test runs
    Test,
    /// Production, sanitized errors
    Production,
}

impl Environment {
    /// Whether error details must be hidden from clients
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "test" | "testing" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Validation(format!("Unknown environment: {other}"))),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Listener settings
    #[validate(nested)]
    pub server: ServerSettings,
    /// Token signing and expiry
    #[validate(nested)]
    pub auth: AuthSettings,
    /// Gateway-wide rate limiting
    #[validate(nested)]
    pub rate_limit: RateLimitSettings,
    /// Default balancing algorithm
    pub load_balancer: LoadBalancerSettings,
    /// Instance probing
    #[validate(nested)]
    pub health_check: HealthCheckSettings,
    /// Breaker thresholds
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Response cache tiers
    #[validate(nested)]
    pub cache: CacheSettings,
    /// Log level and format
    pub logging: LoggingConfig,
    /// OpenTelemetry export
    pub telemetry: TracingConfig,
    /// Allowed origins
    pub cors: CorsSettings,
    /// Shared store connection
    pub redis: RedisSettings,
    /// Upstream forwarding
    #[validate(nested)]
    pub proxy: ProxySettings,
    /// Route table seed
    pub routes: Vec<Route>,
    /// Backend pools
    #[validate(nested)]
    pub backends: Vec<BackendSettings>,
    /// API key seed
    #[validate(nested)]
    pub api_keys: Vec<ApiKeySettings>,
}

impl GatewayConfig {
    /// Field validation plus cross-section checks
    ///
    /// # Errors
    /// Returns the first problem found
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate backend: {}",
                    backend.name
                )));
            }
        }

        for route in &self.routes {
            route
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
            let is_url = route.backend.starts_with("http://") || route.backend.starts_with("https://");
            if !is_url && !names.contains(route.backend.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Route '{}' targets unknown backend '{}'",
                    route.id, route.backend
                )));
            }
        }

        if self.routes.iter().any(|r| r.auth_required) && self.auth.secret().is_none() {
            return Err(ConfigError::Validation(
                "auth.jwt_secret (JWT_SECRET) is required when a route requires authentication"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Bind port
    #[validate(range(min = 1))]
    pub port: u16,
    /// Maximum buffered request body
    #[validate(range(min = 1))]
    pub body_limit_bytes: usize,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            body_limit_bytes: 10 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Token settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing secret
    pub jwt_secret: Option<Secret<String>>,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Clock skew tolerated on `exp`
    #[validate(range(max = 300))]
    pub leeway_seconds: u64,
    /// Expected `iss` claim
    pub issuer: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_ttl: Duration::from_secs(24 * 60 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            leeway_seconds: 30,
            issuer: None,
        }
    }
}

impl AuthSettings {
    /// Signing secret, if one is configured and non-empty
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.jwt_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Gateway-wide rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Apply the default limit to routes that have none of their own
    pub apply_to_all_routes: bool,
    /// Default window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Default requests per window
    #[validate(range(min = 1))]
    pub max_requests: u64,
    /// Behaviour when the counter store fails
    pub failure_policy: FailurePolicy,
    /// Store call budget
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            apply_to_all_routes: false,
            window: Duration::from_millis(900_000),
            max_requests: 100,
            failure_policy: FailurePolicy::FailOpen,
            store_timeout: Duration::from_millis(500),
        }
    }
}

impl RateLimitSettings {
    /// IP-scoped policy used for routes without their own limit
    #[must_use]
    pub fn default_policy(&self) -> Option<RateLimitPolicy> {
        self.apply_to_all_routes.then(|| {
            RateLimitPolicy::new(self.max_requests, self.window.as_secs().max(1))
                .with_scope(RateLimitScope::Ip)
        })
    }
}

/// Load balancer defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerSettings {
    /// Algorithm for backends that do not set one
    pub algorithm: BalancingAlgorithm,
}

/// Health probing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthCheckSettings {
    /// Run the prober
    pub enabled: bool,
    /// Time between rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe budget
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Probe path for backends that do not set one
    #[validate(length(min = 1))]
    pub path: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(5_000),
            path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

impl HealthCheckSettings {
    /// Prober configuration
    #[must_use]
    pub fn prober_config(&self) -> HealthProberConfig {
        HealthProberConfig {
            interval: self.interval,
            timeout: self.timeout,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Time spent open before a probe is admitted
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(60_000),
        }
    }
}

impl CircuitBreakerSettings {
    /// Breaker configuration; the probe budget follows the upstream timeout
    #[must_use]
    pub fn breaker_config(&self, probe_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.failure_threshold, self.recovery_timeout)
            .with_probe_timeout(probe_timeout)
    }
}

/// Response cache tiers
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheSettings {
    /// Master switch
    pub enabled: bool,
    /// Local tier capacity
    #[validate(range(min = 1))]
    pub local_capacity: usize,
    /// Upper bound on local copies of shared entries
    #[serde(with = "humantime_serde")]
    pub local_ttl: Duration,
    /// Shared tier call budget
    #[serde(with = "humantime_serde")]
    pub shared_timeout: Duration,
    /// Default vary-by headers
    pub vary_by: Vec<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = ResponseCacheConfig::default();
        Self {
            enabled: defaults.enabled,
            local_capacity: defaults.local_capacity,
            local_ttl: defaults.local_ttl,
            shared_timeout: defaults.shared_timeout,
            vary_by: defaults.default_vary_by,
        }
    }
}

impl CacheSettings {
    /// Response cache configuration
    #[must_use]
    pub fn cache_config(&self) -> ResponseCacheConfig {
        ResponseCacheConfig {
            enabled: self.enabled,
            local_capacity: self.local_capacity,
            local_ttl: self.local_ttl,
            shared_timeout: self.shared_timeout,
            default_vary_by: self.vary_by.iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }
}

/// CORS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    /// Allowed origins, `*` for any
    pub origins: Vec<String>,
    /// Allow credentials
    pub allow_credentials: bool,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            origins: vec!["http://localhost:3000".to_string()],
            allow_credentials: false,
        }
    }
}

/// Shared store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Connection URL; unset keeps all state in process
    pub url: Option<String>,
    /// Key namespace
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "api-gateway:".to_string(),
        }
    }
}

/// Upstream forwarding
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxySettings {
    /// Default per-request budget when a route sets none
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// TCP connect budget
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle connections kept per upstream host
    #[validate(range(max = 1024))]
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 32,
        }
    }
}

/// A backend pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendSettings {
    /// Backend name referenced by routes
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    /// Algorithm override
    #[serde(default)]
    pub algorithm: Option<BalancingAlgorithm>,
    /// Probe path override
    #[serde(default)]
    pub health_path: Option<String>,
    /// Instances
    #[serde(default)]
    #[validate(nested)]
    pub instances: Vec<InstanceSettings>,
}

/// One backend instance
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InstanceSettings {
    /// Base URL, `http://host:port`
    #[validate(url)]
    pub url: String,
    /// Relative weight
    #[serde(default = "default_weight")]
    #[validate(range(min = 1))]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A seeded API key
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApiKeySettings {
    /// Key value
    pub key: Secret<String>,
    /// Owning subject
    #[validate(length(min = 1))]
    pub owner: String,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Disabled keys never verify
    #[serde(default = "default_active")]
    pub active: bool,
    /// Expiry
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}
