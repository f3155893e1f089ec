//! Request pipeline.
//!
//! Each request walks an ordered list of [`Stage`]s. A stage either lets the
//! request continue, answers it directly (a cache hit), or fails it. The first
//! stage that does not continue ends the walk; later stages never run.
//!
//! ```text
//! resolve -> auth -> rate limit -> cache lookup -> circuit -> balance
//! ```

use crate::auth::Authenticator;
use async_trait::async_trait;
use gateway_core::{
    GatewayError, GatewayRequest, GatewayResponse, GatewayResult, HttpMethod, Identity,
    IdentitySource, RateLimitPolicy, RateLimitScope, Route,
};
use gateway_resilience::{
    CacheKey, CircuitAdmission, CircuitBreakerRegistry, RateLimitDecision, RateLimitKey,
    RateLimiter, ResponseCache,
};
use gateway_routing::{ConnectionGuard, LoadBalancer, RouteResolver};
use gateway_telemetry::MetricsSink;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Value of the `x-cache` response header
pub const CACHE_HEADER: &str = "x-cache";

/// Cache result for the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache
    Hit,
    /// Looked up and not found
    Miss,
}

impl CacheStatus {
    /// Header value
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// What a stage decided
#[derive(Debug)]
pub enum Outcome {
    /// Run the next stage
    Continue,
    /// Answer the request with this response
    Respond(GatewayResponse),
    /// Fail the request
    Fail(GatewayError),
}

impl From<GatewayResult<Self>> for Outcome {
    fn from(result: GatewayResult<Self>) -> Self {
        result.unwrap_or_else(Outcome::Fail)
    }
}

/// State carried through the pipeline for one request
pub struct RequestContext {
    /// Inbound request
    pub request: GatewayRequest,
    /// Resolved route
    pub route: Option<Arc<Route>>,
    /// Authenticated caller
    pub identity: Option<Identity>,
    /// Rate-limit decision, when the route is limited
    pub rate_limit: Option<RateLimitDecision>,
    /// Key to store the response under after a cache miss
    pub cache_key: Option<CacheKey>,
    /// Cache result
    pub cache_status: Option<CacheStatus>,
    /// Breaker admission for the route's backend; outcomes are reported through it
    pub breaker: Option<CircuitAdmission>,
    /// In-flight slot on the selected instance
    pub connection: Option<ConnectionGuard>,
    /// When the request entered the gateway
    pub started_at: Instant,
}

impl RequestContext {
    /// Start a context for a request
    #[must_use]
    pub fn new(request: GatewayRequest) -> Self {
        Self {
            request,
            route: None,
            identity: None,
            rate_limit: None,
            cache_key: None,
            cache_status: None,
            breaker: None,
            connection: None,
            started_at: Instant::now(),
        }
    }

    /// Resolved route
    ///
    /// # Errors
    /// Returns an internal error if no route has been resolved yet
    pub fn route(&self) -> GatewayResult<Arc<Route>> {
        self.route
            .clone()
            .ok_or_else(|| GatewayError::internal("pipeline stage ran before route resolution"))
    }

    /// Path with the query string, as used for cache keys
    #[must_use]
    pub fn path_and_query(&self) -> String {
        match self.request.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.request.path),
            _ => self.request.path.clone(),
        }
    }

    /// Milliseconds since the request entered the gateway
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request.request_id)
            .field("route", &self.route.as_ref().map(|r| r.id.as_str()))
            .field("identity", &self.identity.as_ref().map(|i| i.subject.as_str()))
            .field("cache_status", &self.cache_status)
            .finish_non_exhaustive()
    }
}

/// One step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Inspect or update the context and decide how to proceed
    async fn run(&self, ctx: &mut RequestContext) -> Outcome;
}

/// Maps the request to its route
pub struct ResolveStage {
    resolver: Arc<RouteResolver>,
}

impl ResolveStage {
    /// Create the stage
    pub fn new(resolver: Arc<RouteResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Stage for ResolveStage {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        match self
            .resolver
            .resolve(&ctx.request.path, ctx.request.method.as_str())
        {
            Ok(route) => {
                ctx.route = Some(route);
                Outcome::Continue
            }
            Err(e) => Outcome::Fail(e),
        }
    }
}

/// Authenticates the caller and enforces the route's requirements
///
/// A bad credential only fails the request when the route needs an identity;
/// on a public route the caller is treated as anonymous.
pub struct AuthStage {
    authenticator: Arc<Authenticator>,
}

impl AuthStage {
    /// Create the stage
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<Outcome> {
        let route = ctx.route()?;
        let needs_identity = route.auth_required
            || !route.required_roles.is_empty()
            || !route.required_scopes.is_empty();

        let result = self
            .authenticator
            .authenticate(&ctx.request.headers, ctx.request.query.as_deref())
            .await;
        match result {
            Ok(outcome) => ctx.identity = outcome.into_identity(),
            Err(e) if needs_identity => {
                warn!(route = %route.id, error = %e, "Authentication failed");
                return Err(e.into());
            }
            Err(e) => {
                debug!(route = %route.id, error = %e, "Ignoring invalid credential on public route");
            }
        }

        Authenticator::authorize(ctx.identity.as_ref(), &route).map_err(|e| {
            warn!(route = %route.id, error = %e, "Authorization failed");
            GatewayError::from(e)
        })?;
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        self.apply(ctx).await.into()
    }
}

/// Counts the request against the route's quota
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    default_policy: Option<RateLimitPolicy>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimitStage {
    /// Create the stage; `default_policy` applies to routes without their own
    pub fn new(
        limiter: Arc<RateLimiter>,
        default_policy: Option<RateLimitPolicy>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            limiter,
            default_policy,
            metrics,
        }
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<Outcome> {
        let route = ctx.route()?;
        let Some(policy) = route.rate_limit.as_ref().or(self.default_policy.as_ref()) else {
            return Ok(Outcome::Continue);
        };

        let key = rate_limit_key(policy, &route, ctx);
        let decision = self.limiter.check(&key, policy.limit, policy.window()).await;
        let allowed = decision.allowed;
        let error = (!allowed).then(|| decision.to_error());
        ctx.rate_limit = Some(decision);

        match error {
            None => Ok(Outcome::Continue),
            Some(err) => {
                self.metrics.record_rate_limited(&policy.scope.to_string());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        self.apply(ctx).await.into()
    }
}

/// Counter key for a request under a policy
///
/// User and client scopes fall back to the client IP for anonymous callers.
#[must_use]
pub fn rate_limit_key(policy: &RateLimitPolicy, route: &Route, ctx: &RequestContext) -> RateLimitKey {
    let endpoint = format!("{} {}", route.method, route.normalized_path());
    let ip = || ctx.request.client_ip.clone().unwrap_or_else(|| "unknown".to_string());

    match policy.scope {
        RateLimitScope::Ip => RateLimitKey::new(policy.scope, ip(), endpoint),
        RateLimitScope::User => {
            let id = ctx
                .identity
                .as_ref()
                .filter(|i| i.source == IdentitySource::Token)
                .map_or_else(ip, |i| i.subject.clone());
            RateLimitKey::new(policy.scope, id, endpoint)
        }
        RateLimitScope::Client => {
            let id = ctx.identity.as_ref().map_or_else(ip, |i| i.subject.clone());
            RateLimitKey::new(policy.scope, id, endpoint)
        }
        RateLimitScope::Endpoint => RateLimitKey::new(policy.scope, "*", endpoint),
        RateLimitScope::Global => RateLimitKey::new(policy.scope, "global", "*"),
    }
}

/// Serves cached responses for cacheable routes
pub struct CacheLookupStage {
    cache: Arc<ResponseCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl CacheLookupStage {
    /// Create the stage
    pub fn new(cache: Arc<ResponseCache>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { cache, metrics }
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<Outcome> {
        let route = ctx.route()?;
        let Some(policy) = route.cache.as_ref() else {
            return Ok(Outcome::Continue);
        };
        if !route.is_cacheable() || !self.cache.is_enabled() {
            return Ok(Outcome::Continue);
        }

        let vary_by = self.cache.vary_by(policy.vary_by.as_deref());
        let key = CacheKey::derive(
            HttpMethod::Get,
            &ctx.path_and_query(),
            &ctx.request.headers,
            vary_by,
        );

        match self.cache.get(&key, policy.strategy).await {
            Some(cached) => {
                debug!(key = %key, route = %route.id, "Cache hit");
                self.metrics.record_cache(true);
                ctx.cache_status = Some(CacheStatus::Hit);
                let mut response = cached.into_response();
                response.set_header(CACHE_HEADER, CacheStatus::Hit.as_str());
                Ok(Outcome::Respond(response))
            }
            None => {
                self.metrics.record_cache(false);
                ctx.cache_status = Some(CacheStatus::Miss);
                ctx.cache_key = Some(key);
                Ok(Outcome::Continue)
            }
        }
    }
}

#[async_trait]
impl Stage for CacheLookupStage {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        self.apply(ctx).await.into()
    }
}

/// Rejects requests to a backend whose circuit is open
pub struct CircuitStage {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl CircuitStage {
    /// Create the stage
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<Outcome> {
        let route = ctx.route()?;
        ctx.breaker = Some(self.breakers.admit(&route.backend)?);
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Stage for CircuitStage {
    fn name(&self) -> &'static str {
        "circuit"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        self.apply(ctx).into()
    }
}

/// Picks a healthy instance and takes an in-flight slot on it
pub struct BalanceStage {
    balancer: Arc<LoadBalancer>,
}

impl BalanceStage {
    /// Create the stage
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self { balancer }
    }

    fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<Outcome> {
        let route = ctx.route()?;
        let guard = self
            .balancer
            .acquire(&route.backend, ctx.request.client_ip.as_deref())?;
        ctx.connection = Some(guard);
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl Stage for BalanceStage {
    fn name(&self) -> &'static str {
        "balance"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        self.apply(ctx).into()
    }
}

/// Ordered list of stages
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Empty pipeline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stage names in order
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run stages until one does not continue
    pub async fn run(&self, ctx: &mut RequestContext) -> Outcome {
        for stage in &self.stages {
            match stage.run(ctx).await {
                Outcome::Continue => {}
                outcome => {
                    debug!(stage = stage.name(), request_id = %ctx.request.request_id, "Pipeline stopped");
                    return outcome;
                }
            }
        }
        Outcome::Continue
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyRecord, InMemoryCredentialStore};
    use gateway_core::{CachePolicy, CachedResponse, CacheStrategy};
    use gateway_resilience::{CircuitBreakerConfig, CircuitState};
    use gateway_routing::{BalancingAlgorithm, Instance};
    use gateway_telemetry::{NoopMetrics, PrometheusMetrics};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(method: http::Method, path: &str) -> GatewayRequest {
        GatewayRequest::new(method, path).with_client_ip("10.0.0.1")
    }

    fn ctx_for(route: Route, request: GatewayRequest) -> RequestContext {
        let mut ctx = RequestContext::new(request);
        ctx.route = Some(Arc::new(route));
        ctx
    }

    fn metrics() -> Arc<dyn MetricsSink> {
        Arc::new(NoopMetrics)
    }

    struct Counting(Arc<AtomicUsize>, Outcome);

    #[async_trait]
    impl Stage for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _ctx: &mut RequestContext) -> Outcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            match &self.1 {
                Outcome::Continue => Outcome::Continue,
                Outcome::Respond(r) => Outcome::Respond(r.clone()),
                Outcome::Fail(e) => Outcome::Fail(e.clone()),
            }
        }
    }

    #[tokio::test]
    async fn test_first_failing_stage_short_circuits() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new()
            .stage(Counting(Arc::clone(&before), Outcome::Continue))
            .stage(Counting(
                Arc::new(AtomicUsize::new(0)),
                Outcome::Fail(GatewayError::authentication("no")),
            ))
            .stage(Counting(Arc::clone(&after), Outcome::Continue));

        let mut ctx = RequestContext::new(request(http::Method::GET, "/x"));
        assert!(matches!(pipeline.run(&mut ctx).await, Outcome::Fail(_)));
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_stage() {
        let resolver = Arc::new(RouteResolver::from_routes(vec![Route::new(
            "users",
            "/users",
            HttpMethod::Get,
            "svc",
        )]));
        let stage = ResolveStage::new(resolver);

        let mut found = RequestContext::new(request(http::Method::GET, "/users/"));
        assert!(matches!(stage.run(&mut found).await, Outcome::Continue));
        assert_eq!(found.route().expect("route").id, "users");

        let mut missing = RequestContext::new(request(http::Method::POST, "/users"));
        assert!(matches!(
            stage.run(&mut missing).await,
            Outcome::Fail(GatewayError::RouteNotFound { .. })
        ));
    }

    fn auth_stage() -> AuthStage {
        let store = InMemoryCredentialStore::new();
        store.add_key("good-key", ApiKeyRecord::new("svc-1").with_scopes(vec!["read".into()]));
        AuthStage::new(Arc::new(Authenticator::new(Some("secret"), Arc::new(store))))
    }

    #[tokio::test]
    async fn test_auth_stage_public_route_ignores_bad_credential() {
        let route = Route::new("pub", "/pub", HttpMethod::Get, "svc");
        let mut ctx = ctx_for(
            route,
            request(http::Method::GET, "/pub").with_header("x-api-key", "wrong"),
        );
        assert!(matches!(auth_stage().run(&mut ctx).await, Outcome::Continue));
        assert!(ctx.identity.is_none());
    }

    #[tokio::test]
    async fn test_auth_stage_protected_route() {
        let route = Route::new("priv", "/priv", HttpMethod::Get, "svc").with_auth(true);

        let mut anonymous = ctx_for(route.clone(), request(http::Method::GET, "/priv"));
        match auth_stage().run(&mut anonymous).await {
            Outcome::Fail(e) => assert_eq!(e.status_code(), http::StatusCode::UNAUTHORIZED),
            other => panic!("expected failure, got {other:?}"),
        }

        let mut bad = ctx_for(
            route.clone(),
            request(http::Method::GET, "/priv").with_header("x-api-key", "wrong"),
        );
        match auth_stage().run(&mut bad).await {
            Outcome::Fail(e) => assert_eq!(e.to_string(), "Authentication failed: Invalid token"),
            other => panic!("expected failure, got {other:?}"),
        }

        let mut good = ctx_for(
            route,
            request(http::Method::GET, "/priv").with_header("x-api-key", "good-key"),
        );
        assert!(matches!(auth_stage().run(&mut good).await, Outcome::Continue));
        assert_eq!(good.identity.expect("identity").subject, "svc-1");
    }

    #[tokio::test]
    async fn test_auth_stage_scope_mismatch_is_forbidden() {
        let route = Route::new("w", "/w", HttpMethod::Post, "svc")
            .with_auth(true)
            .with_scopes(vec!["write".into()]);
        let mut ctx = ctx_for(
            route,
            request(http::Method::POST, "/w").with_header("x-api-key", "good-key"),
        );
        match auth_stage().run(&mut ctx).await {
            Outcome::Fail(e) => assert_eq!(e.status_code(), http::StatusCode::FORBIDDEN),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_stage_sequence() {
        let route = Route::new("rl", "/rl", HttpMethod::Get, "svc")
            .with_rate_limit(RateLimitPolicy::new(3, 60));
        let sink = Arc::new(PrometheusMetrics::new().expect("metrics"));
        let stage = RateLimitStage::new(
            Arc::new(RateLimiter::in_memory()),
            None,
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
        );

        let mut remaining = Vec::new();
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let mut ctx = ctx_for(route.clone(), request(http::Method::GET, "/rl"));
            outcomes.push(stage.run(&mut ctx).await);
            remaining.push(ctx.rate_limit.expect("decision").remaining);
        }

        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert!(matches!(outcomes[2], Outcome::Continue));
        match &outcomes[3] {
            Outcome::Fail(e) => {
                assert_eq!(e.status_code(), http::StatusCode::TOO_MANY_REQUESTS);
                assert!(e.retry_after().expect("retry after") > 0);
            }
            other => panic!("expected 429, got {other:?}"),
        }
        assert!(sink
            .gather()
            .expect("gather")
            .contains(r#"gateway_rate_limited_total{scope="ip"} 1"#));
    }

    #[tokio::test]
    async fn test_rate_limit_stage_default_policy_and_unlimited_routes() {
        let route = Route::new("open", "/open", HttpMethod::Get, "svc");
        let unlimited = RateLimitStage::new(Arc::new(RateLimiter::in_memory()), None, metrics());
        let mut ctx = ctx_for(route.clone(), request(http::Method::GET, "/open"));
        assert!(matches!(unlimited.run(&mut ctx).await, Outcome::Continue));
        assert!(ctx.rate_limit.is_none());

        let defaulted = RateLimitStage::new(
            Arc::new(RateLimiter::in_memory()),
            Some(RateLimitPolicy::new(1, 60)),
            metrics(),
        );
        let mut first = ctx_for(route.clone(), request(http::Method::GET, "/open"));
        assert!(matches!(defaulted.run(&mut first).await, Outcome::Continue));
        let mut second = ctx_for(route, request(http::Method::GET, "/open"));
        assert!(matches!(defaulted.run(&mut second).await, Outcome::Fail(_)));
    }

    #[test]
    fn test_rate_limit_keys_per_scope() {
        let route = Route::new("r", "/r/", HttpMethod::Get, "svc");
        let mut ctx = ctx_for(route.clone(), request(http::Method::GET, "/r"));
        let key = |scope, ctx: &RequestContext| {
            rate_limit_key(&RateLimitPolicy::new(1, 1).with_scope(scope), &route, ctx).to_string()
        };

        assert_eq!(key(RateLimitScope::Ip, &ctx), "ip:10.0.0.1:GET /r");
        assert_eq!(key(RateLimitScope::User, &ctx), "user:10.0.0.1:GET /r");
        assert_eq!(key(RateLimitScope::Endpoint, &ctx), "endpoint:*:GET /r");
        assert_eq!(key(RateLimitScope::Global, &ctx), "global:global:*");

        ctx.identity = Some(Identity::new("svc-1", IdentitySource::ApiKey));
        assert_eq!(key(RateLimitScope::User, &ctx), "user:10.0.0.1:GET /r");
        assert_eq!(key(RateLimitScope::Client, &ctx), "client:svc-1:GET /r");

        ctx.identity = Some(Identity::new("alice", IdentitySource::Token));
        assert_eq!(key(RateLimitScope::User, &ctx), "user:alice:GET /r");
    }

    #[tokio::test]
    async fn test_cache_lookup_hit_and_miss() {
        let cache = Arc::new(ResponseCache::with_defaults());
        let route = Route::new("c", "/c", HttpMethod::Get, "svc").with_cache(CachePolicy::new(60));
        let stage = CacheLookupStage::new(Arc::clone(&cache), metrics());

        let mut miss = ctx_for(route.clone(), request(http::Method::GET, "/c").with_query("page=1"));
        assert!(matches!(stage.run(&mut miss).await, Outcome::Continue));
        assert_eq!(miss.cache_status, Some(CacheStatus::Miss));
        let key = miss.cache_key.expect("key on miss");
        assert!(key.as_str().starts_with("GET:/c?page=1"));

        cache
            .put(
                &key,
                CachedResponse::new(200, b"cached".to_vec()),
                Duration::from_secs(60),
                &[],
                CacheStrategy::Memory,
            )
            .await;

        let mut hit = ctx_for(route.clone(), request(http::Method::GET, "/c").with_query("page=1"));
        match stage.run(&mut hit).await {
            Outcome::Respond(response) => {
                assert_eq!(response.body.as_ref(), b"cached");
                assert_eq!(
                    response.headers.get(CACHE_HEADER).and_then(|v| v.to_str().ok()),
                    Some("HIT")
                );
            }
            other => panic!("expected cache hit, got {other:?}"),
        }

        let mut other_page = ctx_for(route, request(http::Method::GET, "/c").with_query("page=2"));
        assert!(matches!(stage.run(&mut other_page).await, Outcome::Continue));
    }

    #[tokio::test]
    async fn test_cache_lookup_skips_uncached_routes() {
        let stage = CacheLookupStage::new(Arc::new(ResponseCache::with_defaults()), metrics());
        let post = Route::new("p", "/p", HttpMethod::Post, "svc").with_cache(CachePolicy::new(60));
        let mut ctx = ctx_for(post, request(http::Method::POST, "/p"));
        assert!(matches!(stage.run(&mut ctx).await, Outcome::Continue));
        assert!(ctx.cache_status.is_none());
    }

    #[tokio::test]
    async fn test_circuit_stage_rejects_open_backend() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
            1,
            Duration::from_secs(60),
        )));
        let stage = CircuitStage::new(Arc::clone(&breakers));
        let route = Route::new("r", "/r", HttpMethod::Get, "svc");

        let mut ok = ctx_for(route.clone(), request(http::Method::GET, "/r"));
        assert!(matches!(stage.run(&mut ok).await, Outcome::Continue));
        ok.breaker.expect("breaker attached").record_status(503);
        assert_eq!(breakers.get_or_create("svc").state(), CircuitState::Open);

        let mut rejected = ctx_for(route, request(http::Method::GET, "/r"));
        match stage.run(&mut rejected).await {
            Outcome::Fail(e) => assert_eq!(e.status_code(), http::StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("expected circuit open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_balance_stage_holds_connection() {
        let balancer = Arc::new(LoadBalancer::new(BalancingAlgorithm::RoundRobin));
        balancer.add_instance("svc", Instance::new("127.0.0.1", 9001));
        let stage = BalanceStage::new(Arc::clone(&balancer));
        let route = Route::new("r", "/r", HttpMethod::Get, "svc");

        let mut ctx = ctx_for(route.clone(), request(http::Method::GET, "/r"));
        assert!(matches!(stage.run(&mut ctx).await, Outcome::Continue));
        assert_eq!(balancer.stats("svc").expect("stats").total_connections, 1);
        drop(ctx);
        assert_eq!(balancer.stats("svc").expect("stats").total_connections, 0);

        balancer.mark_health("svc", "127.0.0.1", 9001, false);
        let mut none = ctx_for(route, request(http::Method::GET, "/r"));
        assert!(matches!(
            stage.run(&mut none).await,
            Outcome::Fail(GatewayError::NoHealthyInstance { .. })
        ));
    }

    #[tokio::test]
    async fn test_stage_without_route_fails_internally() {
        let stage = CircuitStage::new(Arc::new(CircuitBreakerRegistry::default()));
        let mut ctx = RequestContext::new(request(http::Method::GET, "/x"));
        assert!(matches!(
            stage.run(&mut ctx).await,
            Outcome::Fail(GatewayError::Internal { .. })
        ));
    }
}
