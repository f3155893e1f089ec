//! # Gateway Resilience
//!
//! Stateful protection for backends and the gateway itself:
//! - Circuit breaker per backend, with a registry
//! - Fixed-window rate limiting over a pluggable store
//! - Two-tier response cache with tag and pattern invalidation
//! - Redis-backed shared stores (feature `redis`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;
#[cfg(feature = "redis")]
pub mod redis_store;

// Re-export main types
pub use cache::{
    CacheBackend, CacheEnvelope, CacheError, CacheKey, CacheResult, CacheStats,
    MemoryCacheBackend, ResponseCache, ResponseCacheConfig,
};
pub use circuit_breaker::{
    CircuitAdmission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitPermit, CircuitState, TransitionObserver,
};
pub use rate_limiter::{
    FailurePolicy, MemoryRateLimitStore, RateLimitDecision, RateLimitKey, RateLimitStore,
    RateLimitStoreError, RateLimiter,
};
#[cfg(feature = "redis")]
pub use redis_store::{RedisCacheBackend, RedisRateLimitStore};
