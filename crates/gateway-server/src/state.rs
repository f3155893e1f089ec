//! Shared application state.

use crate::auth::{Authenticator, CredentialStore, InMemoryCredentialStore};
use crate::dispatcher::{build_client, DispatchHooks, Dispatcher};
use crate::pipeline::{
    AuthStage, BalanceStage, CacheLookupStage, CircuitStage, Pipeline, RateLimitStage,
    ResolveStage,
};
use gateway_config::GatewayConfig;
use gateway_core::{GatewayError, GatewayResult};
use gateway_resilience::{
    CacheBackend, CircuitBreakerRegistry, RateLimitStore, RateLimiter, ResponseCache,
};
use gateway_routing::{Instance, LoadBalancer, RouteResolver};
use gateway_telemetry::{MetricsSink, PrometheusMetrics};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<GatewayConfig>,
    /// Route table
    pub resolver: Arc<RouteResolver>,
    /// Backend pools
    pub balancer: Arc<LoadBalancer>,
    /// Per-backend circuit breakers
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Fixed-window limiter
    pub limiter: Arc<RateLimiter>,
    /// Response cache
    pub cache: Arc<ResponseCache>,
    /// Credential checks and token issuance
    pub authenticator: Arc<Authenticator>,
    /// Prometheus collectors
    pub metrics: Arc<PrometheusMetrics>,
    /// Pipeline plus upstream client
    pub dispatcher: Arc<Dispatcher>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl AppState {
    /// Start building state
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }

    /// Seconds since the state was built
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.config.environment)
            .field("routes", &self.resolver.len())
            .field("backends", &self.balancer.backends())
            .field("pipeline", self.dispatcher.pipeline())
            .finish_non_exhaustive()
    }
}

/// Builder for [`AppState`]
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<GatewayConfig>,
    metrics: Option<Arc<PrometheusMetrics>>,
    rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    shared_cache: Option<Arc<dyn CacheBackend>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    hooks: Vec<Arc<dyn DispatchHooks>>,
}

impl AppStateBuilder {
    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing metrics registry
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PrometheusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Keep rate-limit counters in a shared store
    #[must_use]
    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    /// Attach a shared cache tier
    #[must_use]
    pub fn shared_cache(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.shared_cache = Some(backend);
        self
    }

    /// Replace the configuration-seeded credential store
    #[must_use]
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Install a dispatch hook after the built-in gateway headers
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn DispatchHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Wire every component together
    ///
    /// # Errors
    /// Returns an error when a backend instance URL is invalid or a client
    /// cannot be created
    pub fn build(self) -> GatewayResult<AppState> {
        let config = self.config.unwrap_or_default();

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => PrometheusMetrics::shared()
                .map_err(|e| GatewayError::internal(format!("Failed to create metrics: {e}")))?,
        };
        let sink: Arc<dyn MetricsSink> = Arc::clone(&metrics) as Arc<dyn MetricsSink>;

        let resolver = Arc::new(RouteResolver::from_routes(config.routes.clone()));
        let balancer = Arc::new(register_backends(&config)?);

        let observer_sink = Arc::clone(&sink);
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.breaker_config(config.proxy.timeout))
                .with_observer(Arc::new(move |backend, state| {
                    observer_sink.record_circuit_transition(backend, &state.to_string());
                })),
        );

        let limiter = Arc::new(
            match self.rate_limit_store {
                Some(store) => RateLimiter::new(store),
                None => RateLimiter::in_memory(),
            }
            .with_failure_policy(config.rate_limit.failure_policy)
            .with_store_timeout(config.rate_limit.store_timeout),
        );

        let mut cache = ResponseCache::new(config.cache.cache_config());
        if let Some(shared) = self.shared_cache {
            cache = cache.with_shared(shared);
        }
        let cache = Arc::new(cache);

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(InMemoryCredentialStore::from_settings(&config.api_keys)));
        let authenticator = Arc::new(Authenticator::from_settings(&config.auth, credentials));

        let pipeline = Pipeline::new()
            .stage(ResolveStage::new(Arc::clone(&resolver)))
            .stage(AuthStage::new(Arc::clone(&authenticator)))
            .stage(RateLimitStage::new(
                Arc::clone(&limiter),
                config.rate_limit.default_policy(),
                Arc::clone(&sink),
            ))
            .stage(CacheLookupStage::new(Arc::clone(&cache), Arc::clone(&sink)))
            .stage(CircuitStage::new(Arc::clone(&breakers)))
            .stage(BalanceStage::new(Arc::clone(&balancer)));

        let client = build_client(&config.proxy)
            .map_err(|e| GatewayError::internal(format!("Failed to build upstream client: {e}")))?;
        let dispatcher = self.hooks.into_iter().fold(
            Dispatcher::new(pipeline, client, Arc::clone(&cache), sink)
                .with_default_timeout(config.proxy.timeout)
                .with_buffer_limit(config.server.body_limit_bytes)
                .with_sanitized_errors(config.environment.is_production()),
            Dispatcher::with_hook,
        );
        let dispatcher = Arc::new(dispatcher);

        info!(
            environment = %config.environment,
            routes = resolver.len(),
            backends = balancer.backends().len(),
            "Gateway state initialized"
        );

        Ok(AppState {
            config: Arc::new(config),
            resolver,
            balancer,
            breakers,
            limiter,
            cache,
            authenticator,
            metrics,
            dispatcher,
            started_at: Instant::now(),
        })
    }
}

/// Pools from `backends`, plus a single-instance pool for each route that
/// targets a URL directly
fn register_backends(config: &GatewayConfig) -> GatewayResult<LoadBalancer> {
    let balancer = LoadBalancer::new(config.load_balancer.algorithm);

    for backend in &config.backends {
        let health_path = backend
            .health_path
            .clone()
            .or_else(|| Some(config.health_check.path.clone()));
        balancer.add_backend(backend.name.clone(), backend.algorithm, health_path);
        for instance in &backend.instances {
            let parsed = Instance::from_url(&instance.url)?.with_weight(instance.weight);
            balancer.add_instance(&backend.name, parsed);
        }
    }

    for route in &config.routes {
        let is_url = route.backend.starts_with("http://") || route.backend.starts_with("https://");
        if is_url && balancer.pool(&route.backend).is_none() {
            balancer.add_instance(&route.backend, Instance::from_url(&route.backend)?);
        }
    }

    Ok(balancer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::{BackendSettings, InstanceSettings};
    use gateway_core::{HttpMethod, Route};

    #[test]
    fn test_build_from_default_config() {
        let state = AppState::builder()
            .config(GatewayConfig::default())
            .build()
            .expect("state should build");
        assert!(state.resolver.is_empty());
        assert!(state.balancer.backends().is_empty());
        assert_eq!(
            state.dispatcher.pipeline().stage_names(),
            vec!["resolve", "auth", "rate_limit", "cache_lookup", "circuit", "balance"]
        );
    }

    #[test]
    fn test_backends_and_url_routes_are_registered() {
        let mut config = GatewayConfig::default();
        config.backends.push(BackendSettings {
            name: "users".into(),
            algorithm: None,
            health_path: None,
            instances: vec![
                InstanceSettings {
                    url: "http://10.0.0.1:8080".into(),
                    weight: 1,
                },
                InstanceSettings {
                    url: "http://10.0.0.2:8080".into(),
                    weight: 3,
                },
            ],
        });
        config
            .routes
            .push(Route::new("direct", "/direct", HttpMethod::Get, "http://127.0.0.1:9000"));

        let state = AppState::builder().config(config).build().expect("state should build");

        assert_eq!(state.balancer.stats("users").expect("users pool").total, 2);
        assert_eq!(
            state
                .balancer
                .stats("http://127.0.0.1:9000")
                .expect("url pool")
                .total,
            1
        );
    }

    #[test]
    fn test_invalid_instance_url_fails() {
        let mut config = GatewayConfig::default();
        config.backends.push(BackendSettings {
            name: "broken".into(),
            algorithm: None,
            health_path: None,
            instances: vec![InstanceSettings {
                url: "not a url".into(),
                weight: 1,
            }],
        });
        assert!(AppState::builder().config(config).build().is_err());
    }
}
