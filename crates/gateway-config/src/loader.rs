//! Configuration loading from files and the environment.

use crate::config::{Environment, GatewayConfig};
use crate::error::{ConfigError, ConfigResult};
use gateway_routing::BalancingAlgorithm;
use gateway_telemetry::LogFormat;
use humantime_serde::re::humantime;
use secrecy::Secret;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML
    Yaml,
    /// TOML
    Toml,
    /// JSON
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    ///
    /// # Errors
    /// Returns `UnsupportedFormat` for unknown extensions
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Yaml => "YAML",
            Self::Toml => "TOML",
            Self::Json => "JSON",
        }
    }

    /// Parse a document
    ///
    /// # Errors
    /// Returns `Parse` when the document does not match the schema
    pub fn parse(self, contents: &str) -> ConfigResult<GatewayConfig> {
        let parse_err = |message: String| ConfigError::Parse {
            format: self.name(),
            message,
        };
        match self {
            Self::Yaml => serde_yaml::from_str(contents).map_err(|e| parse_err(e.to_string())),
            Self::Toml => toml::from_str(contents).map_err(|e| parse_err(e.to_string())),
            Self::Json => serde_json::from_str(contents).map_err(|e| parse_err(e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum EnvSource {
    Process,
    Vars(HashMap<String, String>),
    Disabled,
}

impl EnvSource {
    fn get(&self, name: &str) -> Option<String> {
        let value = match self {
            Self::Process => std::env::var(name).ok(),
            Self::Vars(vars) => vars.get(name).cloned(),
            Self::Disabled => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Builds a [`GatewayConfig`] from defaults, a file and environment overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: EnvSource,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading overrides from the process environment
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            env: EnvSource::Process,
        }
    }

    /// Read this file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Read the file named by `GATEWAY_CONFIG` unless a file is already set
    #[must_use]
    pub fn with_env_file(mut self) -> Self {
        if self.file.is_none() {
            self.file = self.env.get(CONFIG_PATH_ENV).map(PathBuf::from);
        }
        self
    }

    /// Take overrides from `vars` instead of the process environment
    #[must_use]
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env = EnvSource::Vars(vars);
        self
    }

    /// Skip environment overrides
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.env = EnvSource::Disabled;
        self
    }

    /// Load, override and validate
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an override is
    /// malformed, or validation fails
    pub async fn load(&self) -> ConfigResult<GatewayConfig> {
        let mut config = match &self.file {
            Some(path) => {
                let format = ConfigFormat::from_path(path)?;
                let contents =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| ConfigError::Io {
                            path: path.clone(),
                            source,
                        })?;
                info!(path = %path.display(), "Loading configuration file");
                format.parse(&contents)?
            }
            None => {
                debug!("No configuration file, using defaults");
                GatewayConfig::default()
            }
        };

        apply_env_overrides(&mut config, |name| self.env.get(name))?;
        config.validate_all()?;
        Ok(config)
    }
}

/// Apply the deployment environment variables on top of `config`
///
/// # Errors
/// Returns `InvalidEnv` for values that do not parse
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("HOST") {
        config.server.host = v;
    }
    if let Some(v) = lookup("PORT") {
        config.server.port = parse_var("PORT", &v)?;
    }
    if let Some(v) = lookup("GATEWAY_ENV").or_else(|| lookup("NODE_ENV")) {
        config.environment = v.parse::<Environment>().map_err(|e| invalid("GATEWAY_ENV", &v, e))?;
    }

    if let Some(v) = lookup("JWT_SECRET") {
        config.auth.jwt_secret = Some(Secret::new(v));
    }
    if let Some(v) = lookup("JWT_EXPIRES_IN") {
        config.auth.access_token_ttl = parse_span("JWT_EXPIRES_IN", &v)?;
    }
    if let Some(v) = lookup("JWT_REFRESH_EXPIRES_IN") {
        config.auth.refresh_token_ttl = parse_span("JWT_REFRESH_EXPIRES_IN", &v)?;
    }

    if let Some(v) = lookup("RATE_LIMIT_WINDOW_MS") {
        config.rate_limit.window = parse_millis("RATE_LIMIT_WINDOW_MS", &v)?;
    }
    if let Some(v) = lookup("RATE_LIMIT_MAX_REQUESTS") {
        config.rate_limit.max_requests = parse_var("RATE_LIMIT_MAX_REQUESTS", &v)?;
    }

    if let Some(v) = lookup("LOAD_BALANCER_ALGORITHM") {
        config.load_balancer.algorithm = v
            .parse::<BalancingAlgorithm>()
            .map_err(|e| invalid("LOAD_BALANCER_ALGORITHM", &v, e))?;
    }
    if let Some(v) = lookup("HEALTH_CHECK_INTERVAL") {
        config.health_check.interval = parse_millis("HEALTH_CHECK_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("HEALTH_CHECK_TIMEOUT") {
        config.health_check.timeout = parse_millis("HEALTH_CHECK_TIMEOUT", &v)?;
    }

    if let Some(v) = lookup("CIRCUIT_BREAKER_THRESHOLD") {
        config.circuit_breaker.failure_threshold = parse_var("CIRCUIT_BREAKER_THRESHOLD", &v)?;
    }
    if let Some(v) = lookup("CIRCUIT_BREAKER_TIMEOUT") {
        config.circuit_breaker.recovery_timeout = parse_millis("CIRCUIT_BREAKER_TIMEOUT", &v)?;
    }

    if let Some(v) = lookup("LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = lookup("LOG_FORMAT") {
        config.logging.format = match v.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" | "text" => LogFormat::Pretty,
            _ => return Err(invalid("LOG_FORMAT", &v, "expected json or pretty")),
        };
    }

    if let Some(v) = lookup("CORS_ORIGIN") {
        config.cors.origins = v
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(ToString::to_string)
            .collect();
    }

    if let Some(v) = lookup("REDIS_URL") {
        config.redis.url = Some(v);
    }
    if let Some(v) = lookup("REDIS_KEY_PREFIX") {
        config.redis.key_prefix = v;
    }

    Ok(())
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|e: T::Err| invalid(var, value, e))
}

fn parse_millis(var: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_var::<u64>(var, value).map(Duration::from_millis)
}

/// Bare numbers are seconds; otherwise a humantime span such as `24h` or `7d`
fn parse_span(var: &'static str, value: &str) -> ConfigResult<Duration> {
    let trimmed = value.trim();
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return parse_var::<u64>(var, trimmed).map(Duration::from_secs);
    }
    humantime::parse_duration(trimmed).map_err(|e| invalid(var, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::HttpMethod;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file should be created");
        file.write_all(contents.as_bytes()).expect("write should succeed");
        file
    }

    #[tokio::test]
    async fn test_defaults_without_file() {
        let config = ConfigLoader::new().without_env().load().await.expect("load");
        assert_eq!(config.server.port, 3000);
        assert!(config.routes.is_empty());
    }

    #[tokio::test]
    async fn test_yaml_file() {
        let file = write_config(
            ".yaml",
            r#"
environment: production
server:
  port: 8080
proxy:
  timeout: 5s
backends:
  - name: users
    algorithm: least-connections
    instances:
      - url: http://127.0.0.1:4001
      - url: http://127.0.0.1:4002
        weight: 3
routes:
  - id: list-users
    path: /api/users
    method: get
    backend: users
    rate_limit:
      limit: 10
      window_seconds: 60
    cache:
      ttl_seconds: 30
      tags: [users]
"#,
        );

        let config = ConfigLoader::new()
            .with_file(file.path())
            .without_env()
            .load()
            .await
            .expect("load");

        assert!(config.environment.is_production());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.proxy.timeout, Duration::from_secs(5));
        assert_eq!(config.backends[0].instances[1].weight, 3);
        assert_eq!(
            config.backends[0].algorithm,
            Some(BalancingAlgorithm::LeastConnections)
        );

        let route = &config.routes[0];
        assert_eq!(route.method, HttpMethod::Get);
        assert_eq!(route.rate_limit.as_ref().map(|r| r.limit), Some(10));
        assert_eq!(route.cache.as_ref().map(|c| c.tags.clone()), Some(vec!["users".to_string()]));
        assert!(route.active);
    }

    #[tokio::test]
    async fn test_toml_file() {
        let file = write_config(
            ".toml",
            r#"
[server]
port = 9090

[circuit_breaker]
failure_threshold = 3
recovery_timeout = "10s"
"#,
        );

        let config = ConfigLoader::new()
            .with_file(file.path())
            .without_env()
            .load()
            .await
            .expect("load");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_env_overrides_file() {
        let file = write_config(".yaml", "server:\n  port: 8080\n");
        let config = ConfigLoader::new()
            .with_file(file.path())
            .with_env_vars(vars(&[
                ("PORT", "7000"),
                ("NODE_ENV", "production"),
                ("RATE_LIMIT_WINDOW_MS", "60000"),
                ("LOAD_BALANCER_ALGORITHM", "ip-hash"),
                ("CIRCUIT_BREAKER_TIMEOUT", "15000"),
                ("JWT_EXPIRES_IN", "1h"),
                ("JWT_REFRESH_EXPIRES_IN", "3600"),
                ("CORS_ORIGIN", "https://a.example, https://b.example"),
                ("REDIS_KEY_PREFIX", "gw:"),
            ]))
            .load()
            .await
            .expect("load");

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.load_balancer.algorithm, BalancingAlgorithm::IpHash);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(15));
        assert_eq!(config.auth.access_token_ttl, Duration::from_secs(3600));
        assert_eq!(config.auth.refresh_token_ttl, Duration::from_secs(3600));
        assert_eq!(config.cors.origins.len(), 2);
        assert_eq!(config.redis.key_prefix, "gw:");
    }

    #[tokio::test]
    async fn test_gateway_env_wins_over_node_env() {
        let config = ConfigLoader::new()
            .with_env_vars(vars(&[("NODE_ENV", "production"), ("GATEWAY_ENV", "test")]))
            .load()
            .await
            .expect("load");
        assert_eq!(config.environment, Environment::Test);
    }

    #[tokio::test]
    async fn test_invalid_env_value() {
        let err = ConfigLoader::new()
            .with_env_vars(vars(&[("PORT", "http")]))
            .load()
            .await
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::InvalidEnv { var: "PORT", .. }));
    }

    #[tokio::test]
    async fn test_config_path_from_env() {
        let file = write_config(".yml", "server:\n  port: 4321\n");
        let path = file.path().display().to_string();
        let config = ConfigLoader::new()
            .with_env_vars(vars(&[(CONFIG_PATH_ENV, path.as_str())]))
            .with_env_file()
            .load()
            .await
            .expect("load");
        assert_eq!(config.server.port, 4321);
    }

    #[tokio::test]
    async fn test_missing_and_unsupported_files() {
        let missing = ConfigLoader::new()
            .with_file("/nonexistent/gateway.yaml")
            .without_env()
            .load()
            .await;
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let ini = write_config(".ini", "port=1");
        let unsupported = ConfigLoader::new().with_file(ini.path()).without_env().load().await;
        assert!(matches!(unsupported, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_malformed_document() {
        let err = ConfigFormat::Yaml
            .parse("server: [not, a, map]")
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Parse { format: "YAML", .. }));
    }
}
