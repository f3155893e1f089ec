//! # Gateway Config
//!
//! Configuration for the API gateway.
//!
//! Sources, lowest precedence first:
//! - Built-in defaults
//! - A YAML, TOML or JSON file
//! - Environment variables

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod loader;

// Re-export main types
pub use config::{
    ApiKeySettings, AuthSettings, BackendSettings, CacheSettings, CircuitBreakerSettings,
    CorsSettings, Environment, GatewayConfig, HealthCheckSettings, InstanceSettings,
    LoadBalancerSettings, ProxySettings, RateLimitSettings, RedisSettings, ServerSettings,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{apply_env_overrides, ConfigFormat, ConfigLoader, CONFIG_PATH_ENV};
