//! # API Gateway
//!
//! Single entry point in front of a set of HTTP backends. Requests are matched
//! against a route table, authenticated, rate limited, optionally served from
//! cache and forwarded to a healthy backend instance behind a circuit breaker.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults, overridden by GATEWAY_* environment variables
//! api-gateway
//!
//! # Route table and backends from a file
//! api-gateway --config /etc/gateway/gateway.yaml
//!
//! # Override the listener
//! api-gateway --config gateway.yaml --port 9000 --json-logs
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use gateway_config::{ConfigLoader, GatewayConfig};
use gateway_server::{AppState, Server, ServerConfig};
use gateway_telemetry::{init_tracing, shutdown_tracing, LogFormat};
use std::path::PathBuf;
use tracing::{error, info};

/// API gateway server
#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to, overriding the configuration
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level or filter directives
    #[arg(long, env = "GATEWAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let provider = match init_tracing(&config.logging, &config.telemetry) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting API gateway"
    );

    let result = run(config).await;
    shutdown_tracing(provider);

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "Gateway failed");
        std::process::exit(1);
    }
}

/// File, environment, then command-line flags
async fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }

    let mut config = loader.load().await.context("invalid configuration")?;

    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if cli.json_logs {
        config.logging.format = LogFormat::Json;
    }
    Ok(config)
}

async fn run(config: GatewayConfig) -> Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        routes = config.routes.len(),
        backends = config.backends.len(),
        "Configuration loaded"
    );

    let server_config = ServerConfig::from(&config);
    let builder = shared_stores(AppState::builder(), &config).await?;
    let state = builder.config(config).build().context("failed to build gateway state")?;

    Server::new(server_config, state)
        .run()
        .await
        .context("server error")
}

/// Redis-backed counters and cache when a connection URL is configured
#[cfg(feature = "redis")]
async fn shared_stores(
    builder: gateway_server::AppStateBuilder,
    config: &GatewayConfig,
) -> Result<gateway_server::AppStateBuilder> {
    use gateway_resilience::{RedisCacheBackend, RedisRateLimitStore};
    use std::sync::Arc;

    let Some(url) = config.redis.url.as_deref() else {
        return Ok(builder);
    };

    let prefix = config.redis.key_prefix.clone();
    let store = RedisRateLimitStore::connect(url, prefix.clone())
        .await
        .context("failed to connect rate limit store")?;
    let cache = RedisCacheBackend::connect(url, prefix)
        .await
        .context("failed to connect shared cache")?;
    info!("Using Redis for rate limits and the shared cache tier");

    Ok(builder
        .rate_limit_store(Arc::new(store))
        .shared_cache(Arc::new(cache)))
}

#[cfg(not(feature = "redis"))]
async fn shared_stores(
    builder: gateway_server::AppStateBuilder,
    config: &GatewayConfig,
) -> Result<gateway_server::AppStateBuilder> {
    if config.redis.url.is_some() {
        tracing::warn!("redis.url is set but the gateway was built without the redis feature");
    }
    Ok(builder)
}
