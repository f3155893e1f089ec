//! Proxy dispatcher.
//!
//! Runs the [`Pipeline`] and, when every stage lets the request through,
//! forwards it to the selected instance. Afterwards it feeds the outcome back
//! into the circuit breaker and the cache, emits metrics and writes the access
//! log line.
//!
//! Responses are streamed to the client unless they are about to be stored in
//! the cache; cacheable responses are buffered up to a size limit.
//!
//! Hooks run synchronously in a fixed order: `pre_dispatch` just before the
//! upstream call, then either `post_dispatch` on a response or `on_error` on a
//! failure.

use crate::error::ApiError;
use crate::pipeline::{CacheStatus, Outcome, Pipeline, RequestContext, CACHE_HEADER};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use gateway_config::ProxySettings;
use gateway_core::{GatewayError, GatewayRequest, GatewayResponse, GatewayResult};
use gateway_resilience::ResponseCache;
use gateway_telemetry::MetricsSink;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Route id header sent upstream
pub const GATEWAY_ROUTE_HEADER: &str = "x-gateway-route";
/// Dispatch time header sent upstream, epoch milliseconds
pub const GATEWAY_TIMESTAMP_HEADER: &str = "x-gateway-timestamp";
/// Request id header
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Client address chain
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Label used in metrics for requests that matched no route
const UNMATCHED_PATH: &str = "unmatched";

/// Request about to be sent upstream
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// Method
    pub method: Method,
    /// Absolute upstream URL
    pub url: String,
    /// Headers after hop-by-hop filtering and route injection
    pub headers: HeaderMap,
    /// Body
    pub body: Bytes,
    /// Time budget for the whole exchange
    pub timeout: Duration,
}

impl ForwardRequest {
    /// Set a header, ignoring invalid names or values
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }
}

/// Callbacks around the upstream call
pub trait DispatchHooks: Send + Sync {
    /// Adjust the outgoing request
    fn pre_dispatch(&self, _ctx: &RequestContext, _request: &mut ForwardRequest) {}

    /// Adjust the response before it is returned; the body is empty when the
    /// upstream response is being streamed
    fn post_dispatch(&self, _ctx: &RequestContext, _response: &mut GatewayResponse) {}

    /// Observe a failed request
    fn on_error(&self, _ctx: &RequestContext, _error: &GatewayError) {}
}

/// Stamps gateway headers on every forwarded request
#[derive(Debug, Default, Clone, Copy)]
pub struct GatewayHeaders;

impl DispatchHooks for GatewayHeaders {
    fn pre_dispatch(&self, ctx: &RequestContext, request: &mut ForwardRequest) {
        if let Some(route) = &ctx.route {
            request.set_header(GATEWAY_ROUTE_HEADER, &route.id);
        }
        request.set_header(
            GATEWAY_TIMESTAMP_HEADER,
            &Utc::now().timestamp_millis().to_string(),
        );
        request.set_header(REQUEST_ID_HEADER, &ctx.request.request_id);

        if let Some(ip) = &ctx.request.client_ip {
            let chain = match ctx.request.header(FORWARDED_FOR_HEADER) {
                Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
                _ => ip.clone(),
            };
            request.set_header(FORWARDED_FOR_HEADER, &chain);
        }
    }
}

/// Build the upstream HTTP client
///
/// # Errors
/// Returns an error if the client cannot be built
pub fn build_client(settings: &ProxySettings) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .redirect(reqwest::redirect::Policy::none())
        .no_gzip()
        .build()
}

/// Default cap on a response buffered for the cache
pub const DEFAULT_BUFFER_LIMIT: usize = 10 * 1024 * 1024;

/// Response on its way to the client
struct Proxied {
    response: GatewayResponse,
    /// Body still being read from upstream; `response.body` is empty when set
    stream: Option<Body>,
}

impl Proxied {
    fn buffered(response: GatewayResponse) -> Self {
        Self {
            response,
            stream: None,
        }
    }

    fn streamed(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            response: GatewayResponse {
                status,
                headers,
                body: Bytes::new(),
            },
            stream: Some(body),
        }
    }
}

/// Runs the pipeline and forwards requests upstream
pub struct Dispatcher {
    pipeline: Pipeline,
    client: reqwest::Client,
    hooks: Vec<Arc<dyn DispatchHooks>>,
    cache: Arc<ResponseCache>,
    metrics: Arc<dyn MetricsSink>,
    default_timeout: Duration,
    buffer_limit: usize,
    sanitize_errors: bool,
}

impl Dispatcher {
    /// Create a dispatcher with the [`GatewayHeaders`] hook installed
    pub fn new(
        pipeline: Pipeline,
        client: reqwest::Client,
        cache: Arc<ResponseCache>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pipeline,
            client,
            hooks: vec![Arc::new(GatewayHeaders)],
            cache,
            metrics,
            default_timeout: ProxySettings::default().timeout,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            sanitize_errors: false,
        }
    }

    /// Append a hook; hooks run in insertion order
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn DispatchHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Upstream budget for routes without their own timeout
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Largest response body buffered for the cache; bigger ones are streamed uncached
    #[must_use]
    pub fn with_buffer_limit(mut self, bytes: usize) -> Self {
        self.buffer_limit = bytes;
        self
    }

    /// Hide internal error details from clients
    #[must_use]
    pub fn with_sanitized_errors(mut self, sanitize: bool) -> Self {
        self.sanitize_errors = sanitize;
        self
    }

    /// The pipeline in front of the upstream call
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Handle one request end to end
    pub async fn dispatch(&self, request: GatewayRequest) -> Response {
        let mut ctx = RequestContext::new(request);

        let result = match self.pipeline.run(&mut ctx).await {
            Outcome::Continue => self.forward(&ctx).await,
            Outcome::Respond(response) => Ok(Proxied::buffered(response)),
            Outcome::Fail(err) => Err(err),
        };

        let extra_headers = response_headers(&ctx);
        let response = match result {
            Ok(mut proxied) => {
                for hook in &self.hooks {
                    hook.post_dispatch(&ctx, &mut proxied.response);
                }
                for (name, value) in &extra_headers {
                    proxied.response.set_header(name, value);
                }
                into_http(proxied)
            }
            Err(err) => {
                self.record_backend_failure(&ctx, &err);
                for hook in &self.hooks {
                    hook.on_error(&ctx, &err);
                }
                extra_headers
                    .iter()
                    .fold(ApiError::from_gateway(&err, self.sanitize_errors), |e, (name, value)| {
                        e.with_header(name, value)
                    })
                    .into_response()
            }
        };

        self.finish(&ctx, response.status());
        response
    }

    async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Proxied> {
        let route = ctx.route()?;
        let instance = ctx
            .connection
            .as_ref()
            .map(|guard| Arc::clone(guard.instance()))
            .ok_or_else(|| GatewayError::internal("no instance selected for forwarding"))?;

        let mut url = format!("{}{}", instance.url(), route.rewrite_path(&ctx.request.path));
        if let Some(query) = ctx.request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let mut forward = ForwardRequest {
            method: ctx.request.method.clone(),
            url,
            headers: forwardable_headers(&ctx.request.headers),
            body: ctx.request.body.clone(),
            timeout: route.timeout.unwrap_or(self.default_timeout),
        };
        for (name, value) in &route.headers {
            forward.set_header(name, value);
        }
        for hook in &self.hooks {
            hook.pre_dispatch(ctx, &mut forward);
        }

        debug!(
            route = %route.id,
            backend = %route.backend,
            instance = %instance.address(),
            url = %forward.url,
            "Forwarding request"
        );

        let timeout = forward.timeout;
        let mut upstream = self
            .client
            .request(forward.method, &forward.url)
            .headers(forward.headers)
            .body(forward.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| upstream_error(&route.backend, timeout, &e))?;

        let status = upstream.status();
        let headers = forwardable_headers(upstream.headers());

        let cacheable = ctx
            .cache_key
            .as_ref()
            .zip(route.cache.as_ref())
            .filter(|_| status == StatusCode::OK && ctx.request.method == Method::GET);
        let Some((key, policy)) = cacheable else {
            record_status(ctx, status);
            return Ok(Proxied::streamed(
                status,
                headers,
                Body::from_stream(upstream.bytes_stream()),
            ));
        };

        let limit = self.buffer_limit;
        if upstream.content_length().is_some_and(|len| len > limit as u64) {
            debug!(route = %route.id, limit = limit, "Response too large to cache, streaming");
            record_status(ctx, status);
            return Ok(Proxied::streamed(
                status,
                headers,
                Body::from_stream(upstream.bytes_stream()),
            ));
        }

        let mut buffered = BytesMut::new();
        while let Some(chunk) = upstream
            .chunk()
            .await
            .map_err(|e| upstream_error(&route.backend, timeout, &e))?
        {
            if buffered.len() + chunk.len() > limit {
                debug!(route = %route.id, limit = limit, "Response too large to cache, streaming");
                record_status(ctx, status);
                let head = futures::stream::iter([Ok(buffered.freeze()), Ok(chunk)]);
                return Ok(Proxied::streamed(
                    status,
                    headers,
                    Body::from_stream(head.chain(upstream.bytes_stream())),
                ));
            }
            buffered.extend_from_slice(&chunk);
        }

        record_status(ctx, status);
        let response = GatewayResponse {
            status,
            headers,
            body: buffered.freeze(),
        };
        self.cache
            .put(key, response.to_cached(), policy.ttl(), &policy.tags, policy.strategy)
            .await;

        Ok(Proxied::buffered(response))
    }

    fn record_backend_failure(&self, ctx: &RequestContext, err: &GatewayError) {
        let Some(breaker) = &ctx.breaker else {
            return;
        };
        if matches!(
            err,
            GatewayError::Upstream { .. }
                | GatewayError::UpstreamTimeout { .. }
                | GatewayError::NoHealthyInstance { .. }
        ) {
            breaker.record_failure();
        }
    }

    fn finish(&self, ctx: &RequestContext, status: StatusCode) {
        let duration_ms = ctx.elapsed_ms();
        let method = ctx.request.method.as_str();
        let path_label = ctx
            .route
            .as_ref()
            .map_or_else(|| UNMATCHED_PATH.to_string(), |r| r.normalized_path());
        self.metrics
            .record_request(method, &path_label, status.as_u16(), duration_ms);

        info!(
            request_id = %ctx.request.request_id,
            method = %method,
            path = %ctx.request.path,
            status = status.as_u16(),
            duration_ms = duration_ms,
            route = ctx.route.as_ref().map(|r| r.id.as_str()),
            cache = ctx.cache_status.map(|s| s.as_str()),
            "Request completed"
        );
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pipeline", &self.pipeline)
            .field("hooks", &self.hooks.len())
            .field("default_timeout", &self.default_timeout)
            .field("sanitize_errors", &self.sanitize_errors)
            .finish_non_exhaustive()
    }
}

/// Headers added to every response: rate-limit state and the cache result
fn response_headers(ctx: &RequestContext) -> Vec<(&'static str, String)> {
    let mut headers = ctx
        .rate_limit
        .as_ref()
        .map(|d| d.header_pairs())
        .unwrap_or_default();
    if ctx.cache_status == Some(CacheStatus::Miss) {
        headers.push((CACHE_HEADER, CacheStatus::Miss.as_str().to_string()));
    }
    headers
}

/// Copy headers, dropping hop-by-hop ones and those named by `Connection`
#[must_use]
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || connection_listed.iter().any(|c| c == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn upstream_error(backend: &str, timeout: Duration, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        warn!(backend = %backend, timeout_ms = timeout.as_millis() as u64, "Upstream timed out");
        GatewayError::UpstreamTimeout { timeout }
    } else {
        error!(backend = %backend, error = %err, "Upstream request failed");
        GatewayError::upstream(format!("Backend '{backend}' is unreachable"))
    }
}

fn record_status(ctx: &RequestContext, status: StatusCode) {
    if let Some(breaker) = &ctx.breaker {
        breaker.record_status(status.as_u16());
    }
}

fn into_http(proxied: Proxied) -> Response {
    let Proxied { response, stream } = proxied;
    let body = stream.unwrap_or_else(|| Body::from(response.body));
    let mut http = Response::new(body);
    *http.status_mut() = response.status;
    *http.headers_mut() = response.headers;
    http
}
