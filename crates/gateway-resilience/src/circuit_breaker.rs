//! Per-backend circuit breaker.
//!
//! The breaker stops traffic to a backend that keeps failing and lets a single
//! probe through once the recovery timeout has passed.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open
//! Open --(recovery timeout elapsed)--> HalfOpen
//! HalfOpen --(probe ok)--> Closed
//! HalfOpen --(probe failed)--> Open
//! ```

use dashmap::DashMap;
use gateway_core::GatewayError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CircuitState {
    /// Requests flow normally
    Closed = 0,
    /// Requests are rejected without contacting the backend
    Open = 1,
    /// A single probe is allowed through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Callback fired on every state transition
pub type TransitionObserver = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is admitted
    pub recovery_timeout: Duration,
    /// A probe with no recorded outcome after this long is abandoned
    pub probe_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            ..Default::default()
        }
    }

    /// Set the probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Admission ticket handed out by [`CircuitBreaker::check`].
///
/// Every state transition starts a new generation. An outcome reported with a
/// permit from an earlier generation is counted in the totals but never moves
/// the breaker, and only the probe permit can resolve the half-open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    generation: u64,
    probe: bool,
}

impl CircuitPermit {
    /// Whether this request is the half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Generation the permit was issued in
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Circuit breaker for a single backend
pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    /// Bumped on every transition
    generation: AtomicU64,
    /// Consecutive failures while closed
    failure_count: AtomicU32,
    /// Epoch millis when the circuit last opened
    opened_at: AtomicU64,
    probe_in_flight: AtomicBool,
    /// Epoch millis when the current probe was admitted
    probe_started_at: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected: AtomicU64,
    transition_lock: Mutex<()>,
    observer: Option<TransitionObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            generation: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            probe_started_at: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            transition_lock: Mutex::new(()),
            observer: None,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(backend: impl Into<String>) -> Self {
        Self::new(backend, CircuitBreakerConfig::default())
    }

    /// Attach a transition observer
    #[must_use]
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Backend this breaker guards
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Current state as stored
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Check whether a request may be sent to the backend.
    ///
    /// In half-open only one caller gets a permit until the probe outcome is
    /// recorded. The outcome of the request must be reported with the permit.
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when the request must not be attempted
    pub fn check(&self) -> Result<CircuitPermit, GatewayError> {
        let generation = self.generation();
        if self.state() == CircuitState::Closed {
            return Ok(CircuitPermit {
                generation,
                probe: false,
            });
        }
        self.admit_slow()
    }

    /// Record the outcome of a request by HTTP status; 5xx is a failure
    pub fn record_status(&self, permit: CircuitPermit, status: u16) {
        if status >= 500 {
            self.record_failure(permit);
        } else {
            self.record_success(permit);
        }
    }

    /// Record a successful request
    pub fn record_success(&self, permit: CircuitPermit) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        if !self.is_current(permit, "success") {
            return;
        }

        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen if permit.probe => {
                debug!(backend = %self.backend, "Circuit breaker probe succeeded");
                self.transition_to_closed(Some(permit.generation));
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self, permit: CircuitPermit) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if !self.is_current(permit, "failure") {
            return;
        }

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    debug!(
                        backend = %self.backend,
                        failures = failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker failure threshold reached"
                    );
                    self.transition_to_open(Some(permit.generation));
                }
            }
            CircuitState::HalfOpen if permit.probe => {
                debug!(backend = %self.backend, "Circuit breaker probe failed, reopening");
                self.transition_to_open(Some(permit.generation));
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Time until a probe will be admitted; zero when not open
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        match self.state() {
            CircuitState::Closed => Duration::ZERO,
            CircuitState::HalfOpen => Duration::from_secs(1),
            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let elapsed = now_millis().saturating_sub(opened_at);
                let timeout = self.config.recovery_timeout.as_millis() as u64;
                Duration::from_millis(timeout.saturating_sub(elapsed))
            }
        }
    }

    /// Reset to closed
    pub fn reset(&self) {
        self.transition_to_closed(None);
    }

    /// Force the circuit open
    pub fn force_open(&self) {
        self.transition_to_open(None);
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            backend: self.backend.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn is_current(&self, permit: CircuitPermit, outcome: &'static str) -> bool {
        let current = self.generation();
        if permit.generation == current {
            return true;
        }
        debug!(
            backend = %self.backend,
            outcome = outcome,
            permit_generation = permit.generation,
            generation = current,
            "Ignoring outcome from an earlier circuit generation"
        );
        false
    }

    fn recovery_elapsed(&self) -> bool {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        let elapsed = now_millis().saturating_sub(opened_at);
        elapsed >= self.config.recovery_timeout.as_millis() as u64
    }

    fn reject(&self) -> GatewayError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        GatewayError::circuit_open(&self.backend, self.retry_after())
    }

    /// Open or half-open: move to half-open if due, then try to claim the probe
    fn admit_slow(&self) -> Result<CircuitPermit, GatewayError> {
        let _guard = self.transition_lock.lock();

        if self.state() == CircuitState::Open && self.recovery_elapsed() {
            self.store_state(CircuitState::HalfOpen);
            info!(backend = %self.backend, "Circuit breaker half-open, admitting probe");
            self.notify(CircuitState::HalfOpen);
        }

        match self.state() {
            CircuitState::Closed => Ok(CircuitPermit {
                generation: self.generation(),
                probe: false,
            }),
            CircuitState::HalfOpen => self.claim_probe(),
            CircuitState::Open => Err(self.reject()),
        }
    }

    /// Caller holds the transition lock
    fn claim_probe(&self) -> Result<CircuitPermit, GatewayError> {
        let now = now_millis();
        let permit = CircuitPermit {
            generation: self.generation(),
            probe: true,
        };

        if !self.probe_in_flight.swap(true, Ordering::AcqRel) {
            self.probe_started_at.store(now, Ordering::Release);
            return Ok(permit);
        }

        // A probe whose outcome never arrived (cancelled request) must not wedge the breaker.
        let started = self.probe_started_at.load(Ordering::Acquire);
        let stale_after = self.config.probe_timeout.as_millis() as u64;
        if now.saturating_sub(started) >= stale_after {
            warn!(backend = %self.backend, "Circuit breaker probe went stale, admitting another");
            self.probe_started_at.store(now, Ordering::Release);
            return Ok(permit);
        }

        Err(self.reject())
    }

    /// Caller holds the transition lock; returns the previous state
    fn store_state(&self, next: CircuitState) -> CircuitState {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.probe_in_flight.store(false, Ordering::Release);
        CircuitState::from(prev)
    }

    fn transition_to_open(&self, expected_generation: Option<u64>) {
        let _guard = self.transition_lock.lock();
        if expected_generation.is_some_and(|g| g != self.generation()) {
            return;
        }

        let prev = self.store_state(CircuitState::Open);
        self.opened_at.store(now_millis(), Ordering::Release);

        if prev != CircuitState::Open {
            warn!(
                backend = %self.backend,
                failures = self.failure_count.load(Ordering::Relaxed),
                recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.notify(CircuitState::Open);
        }
    }

    fn transition_to_closed(&self, expected_generation: Option<u64>) {
        let _guard = self.transition_lock.lock();
        if expected_generation.is_some_and(|g| g != self.generation()) {
            return;
        }

        let prev = self.store_state(CircuitState::Closed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.opened_at.store(0, Ordering::Release);

        if prev != CircuitState::Closed {
            info!(backend = %self.backend, "Circuit breaker closed");
            self.notify(CircuitState::Closed);
        }
    }

    fn notify(&self, state: CircuitState) {
        if let Some(observer) = &self.observer {
            observer(&self.backend, state);
        }
    }
}

/// A request admitted through a breaker, carrying its permit
#[derive(Debug, Clone)]
pub struct CircuitAdmission {
    breaker: Arc<CircuitBreaker>,
    permit: CircuitPermit,
}

impl CircuitAdmission {
    /// Breaker that admitted the request
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Permit issued for the request
    #[must_use]
    pub fn permit(&self) -> CircuitPermit {
        self.permit
    }

    /// Report the response status
    pub fn record_status(&self, status: u16) {
        self.breaker.record_status(self.permit, status);
    }

    /// Report a failure that produced no response
    pub fn record_failure(&self) {
        self.breaker.record_failure(self.permit);
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Backend name
    pub backend: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Successful outcomes recorded
    pub total_successes: u64,
    /// Failed outcomes recorded
    pub total_failures: u64,
    /// Requests rejected without contacting the backend
    pub rejected: u64,
}

impl CircuitBreakerStats {
    /// Failure rate over all recorded outcomes
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            0.0
        } else {
            self.total_failures as f64 / total as f64
        }
    }
}

/// Owns one breaker per backend, created lazily
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    observer: Option<TransitionObserver>,
}

impl CircuitBreakerRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            observer: None,
        }
    }

    /// Attach an observer to every breaker created from now on
    #[must_use]
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get or lazily create the breaker for a backend
    pub fn get_or_create(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(backend) {
            return Arc::clone(breaker.value());
        }

        let entry = self.breakers.entry(backend.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(backend, self.config.clone());
            if let Some(observer) = &self.observer {
                breaker = breaker.with_observer(Arc::clone(observer));
            }
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    /// Check the backend's breaker and return the admission to report through
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when the backend must not be contacted
    pub fn admit(&self, backend: &str) -> Result<CircuitAdmission, GatewayError> {
        let breaker = self.get_or_create(backend);
        let permit = breaker.check()?;
        Ok(CircuitAdmission { breaker, permit })
    }

    /// Existing breaker for a backend
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend).map(|b| Arc::clone(b.value()))
    }

    /// Statistics for every breaker, sorted by backend
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.backend.cmp(&b.backend));
        stats
    }

    /// Current state per backend
    #[must_use]
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        self.stats().into_iter().map(|s| (s.backend, s.state)).collect()
    }

    /// Reset every breaker to closed
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.value().reset();
        }
    }

    /// Number of tracked backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no backend has been seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
