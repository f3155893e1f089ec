//! Fixed-window rate limiting.
//!
//! A window starts at the first request for a key and lasts `window` from
//! there; it is replaced, never extended, once it has elapsed. Counters live in
//! a [`RateLimitStore`] so a shared backing store can replace the in-process
//! one without touching callers.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gateway_core::{ceil_secs, GatewayError, RateLimitScope};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Rate-limit header names
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Remaining requests in the window
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Window end, epoch milliseconds
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Seconds to wait after a denial
pub const HEADER_RETRY_AFTER: &str = "retry-after";

const SWEEP_EVERY: u64 = 1024;

/// Rate-limit store errors
#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    /// Store could not be reached
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),

    /// Store answered with something unusable
    #[error("Rate limit store error: {0}")]
    Backend(String),

    /// Store did not answer in time
    #[error("Rate limit store timed out after {0:?}")]
    Timeout(Duration),
}

/// Counter identity: scope, identifier and endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Scope type
    pub scope: RateLimitScope,
    /// IP, subject id, or a fixed label
    pub identifier: String,
    /// `METHOD path` of the route
    pub endpoint: String,
}

impl RateLimitKey {
    /// Create a key
    pub fn new(
        scope: RateLimitScope,
        identifier: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scope, self.identifier, self.endpoint)
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured limit
    pub limit: u64,
    /// Requests left in the window
    pub remaining: u64,
    /// Window end, epoch milliseconds
    pub reset_at_ms: u64,
    /// Seconds until the window resets, set on denial
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Header pairs to attach to the response
    #[must_use]
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at_ms.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        headers
    }

    /// Convert a denial into the pipeline error
    #[must_use]
    pub fn to_error(&self) -> GatewayError {
        GatewayError::RateLimitExceeded {
            retry_after_secs: self.retry_after_secs.unwrap_or(1),
            limit: self.limit,
            reset_at_ms: self.reset_at_ms,
        }
    }
}

/// Backing store for rate-limit counters
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically count one request against `key` and report the result
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError>;

    /// Drop the counter for a key
    async fn reset(&self, key: &str) -> Result<(), RateLimitStoreError>;

    /// Store name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    window_start_ms: u64,
    window_end_ms: u64,
}

impl RateWindow {
    fn start(now_ms: u64, window: Duration) -> Self {
        Self {
            count: 1,
            window_start_ms: now_ms,
            window_end_ms: now_ms + window.as_millis() as u64,
        }
    }
}

/// In-process counters, one window per key
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, RateWindow>,
    hits: AtomicU64,
}

impl MemoryRateLimitStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request at an explicit instant (epoch millis)
    pub fn hit_at(&self, key: &str, limit: u64, window: Duration, now_ms: u64) -> RateLimitDecision {
        if self.hits.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_expired(now_ms);
        }

        // The entry guard holds the shard lock, so check-and-increment is atomic per key.
        let current = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let window_state = occupied.get_mut();
                if now_ms >= window_state.window_end_ms {
                    *window_state = RateWindow::start(now_ms, window);
                } else {
                    window_state.count = window_state.count.saturating_add(1);
                }
                *window_state
            }
            Entry::Vacant(vacant) => *vacant.insert(RateWindow::start(now_ms, window)),
        };

        let allowed = current.count <= limit;

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(current.count),
            reset_at_ms: current.window_end_ms,
            retry_after_secs: (!allowed).then(|| {
                ceil_secs(Duration::from_millis(
                    current.window_end_ms.saturating_sub(now_ms),
                ))
            }),
        }
    }

    /// Remove windows that ended before `now_ms`
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.window_end_ms > now_ms);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired rate-limit windows");
        }
        removed
    }

    /// Number of live windows
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        Ok(self.hit_at(key, limit, window, now_millis()))
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitStoreError> {
        self.windows.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// What to do when the store fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Let the request through
    #[default]
    FailOpen,
    /// Deny the request
    FailClosed,
}

/// Rate limiter in front of a store
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter over a store
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            failure_policy: FailurePolicy::FailOpen,
            store_timeout: Duration::from_millis(500),
        }
    }

    /// Create a limiter with in-process counters
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()))
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Bound each store call
    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Active failure policy
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Count a request and decide whether it may proceed
    pub async fn check(&self, key: &RateLimitKey, limit: u64, window: Duration) -> RateLimitDecision {
        let key_str = key.to_string();
        let outcome = match tokio::time::timeout(
            self.store_timeout,
            self.store.hit(&key_str, limit, window),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RateLimitStoreError::Timeout(self.store_timeout)),
        };

        match outcome {
            Ok(decision) => {
                if !decision.allowed {
                    warn!(
                        key = %key_str,
                        limit = limit,
                        retry_after = decision.retry_after_secs.unwrap_or_default(),
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.on_store_error(&key_str, limit, window, &e),
        }
    }

    /// Clear the counter for a key
    ///
    /// # Errors
    /// Returns the store error
    pub async fn reset(&self, key: &RateLimitKey) -> Result<(), RateLimitStoreError> {
        self.store.reset(&key.to_string()).await
    }

    fn on_store_error(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        err: &RateLimitStoreError,
    ) -> RateLimitDecision {
        let reset_at_ms = now_millis() + window.as_millis() as u64;
        match self.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at_ms,
                    retry_after_secs: None,
                }
            }
            FailurePolicy::FailClosed => {
                error!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, denying request"
                );
                RateLimitDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at_ms,
                    retry_after_secs: Some(ceil_secs(window)),
                }
            }
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
