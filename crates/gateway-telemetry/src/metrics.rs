//! Request and state-transition metrics.
//!
//! The pipeline reports through [`MetricsSink`]; [`PrometheusMetrics`] keeps
//! its own registry so several gateways (or tests) can coexist in one process.

use crate::error::TelemetryError;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::fmt;
use std::sync::Arc;

/// Destination for pipeline metrics
pub trait MetricsSink: Send + Sync {
    /// One completed request
    fn record_request(&self, method: &str, path: &str, status: u16, duration_ms: u64);

    /// Circuit breaker state change (`closed`, `half-open`, `open`)
    fn record_circuit_transition(&self, backend: &str, state: &str);

    /// A request denied by a rate limit
    fn record_rate_limited(&self, scope: &str);

    /// A cache lookup
    fn record_cache(&self, hit: bool);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _method: &str, _path: &str, _status: u16, _duration_ms: u64) {}
    fn record_circuit_transition(&self, _backend: &str, _state: &str) {}
    fn record_rate_limited(&self, _scope: &str) {}
    fn record_cache(&self, _hit: bool) {}
}

/// Prometheus-backed sink
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    circuit_state: IntGaugeVec,
    rate_limited_total: IntCounterVec,
    cache_requests_total: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create collectors on a fresh registry
    ///
    /// # Errors
    /// Returns an error if a collector cannot be registered
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total proxied requests"),
            &["method", "path", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_seconds", "Request duration")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["method", "path"],
        )?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "gateway_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["backend"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("gateway_rate_limited_total", "Requests denied by rate limits"),
            &["scope"],
        )?;
        let cache_requests_total = IntCounterVec::new(
            Opts::new("gateway_cache_requests_total", "Cache lookups"),
            &["result"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(cache_requests_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            circuit_state,
            rate_limited_total,
            cache_requests_total,
        })
    }

    /// Shared handle
    ///
    /// # Errors
    /// Returns an error if a collector cannot be registered
    pub fn shared() -> Result<Arc<Self>, TelemetryError> {
        Self::new().map(Arc::new)
    }

    /// Underlying registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn gather(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Encoding(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, method: &str, path: &str, status: u16, duration_ms: u64) {
        self.requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.request_duration
            .with_label_values(&[method, path])
            .observe(duration_ms as f64 / 1000.0);
    }

    fn record_circuit_transition(&self, backend: &str, state: &str) {
        let value = match state {
            "open" => 2,
            "half-open" => 1,
            _ => 0,
        };
        self.circuit_state.with_label_values(&[backend]).set(value);
    }

    fn record_rate_limited(&self, scope: &str) {
        self.rate_limited_total.with_label_values(&[scope]).inc();
    }

    fn record_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_requests_total.with_label_values(&[result]).inc();
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}
