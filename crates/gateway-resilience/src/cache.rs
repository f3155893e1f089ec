//! Two-tier response caching.
//!
//! Provides a cache backend abstraction with:
//! - In-memory caching (process-local tier)
//! - Redis caching (shared tier, behind the `redis` feature)
//! - A tiered response cache (local first, shared second)
//!
//! Shared-tier failures never fail a request; the cache degrades to local-only.

use async_trait::async_trait;
use gateway_core::{CacheStrategy, CachedResponse, HttpMethod};
use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Headers whose values are hashed before they become part of a key
const SENSITIVE_VARY_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie"];

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection error
    #[error("Cache connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("Cache operation timeout after {0:?}")]
    Timeout(Duration),

    /// Backend not available
    #[error("Cache backend not available: {0}")]
    Unavailable(String),

    /// Invalidation pattern did not compile
    #[error("Invalid cache pattern: {0}")]
    InvalidPattern(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache backend trait for polymorphic cache implementations
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value, `None` on miss or expiry
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value with TTL and tags
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String])
        -> CacheResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete every entry carrying `tag`
    async fn delete_by_tag(&self, tag: &str) -> CacheResult<u64>;

    /// Delete every entry whose key matches `pattern`
    async fn delete_matching(&self, pattern: &Regex) -> CacheResult<u64>;

    /// Whether a live entry exists
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Drop every entry
    async fn clear(&self) -> CacheResult<()>;

    /// Check if the backend is healthy
    async fn health_check(&self) -> CacheResult<()>;

    /// Get backend name for metrics
    fn name(&self) -> &'static str;

    /// Check if backend is shared between gateway instances
    fn is_distributed(&self) -> bool;
}

/// Cache key: method, normalized path, query and the vary-by header values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from request attributes
    ///
    /// Credential-bearing headers are hashed so raw secrets never end up in keys.
    #[must_use]
    pub fn derive(method: HttpMethod, path: &str, headers: &HeaderMap, vary_by: &[String]) -> Self {
        let mut key = format!("{}:{}", method.as_str(), gateway_core::normalize_path(path));
        let query = path
            .split_once('?')
            .map(|(_, q)| q.split('#').next().unwrap_or_default())
            .unwrap_or_default();
        if !query.is_empty() {
            key.push('?');
            key.push_str(query);
        }
        for name in vary_by {
            let name = name.to_ascii_lowercase();
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let value = if !value.is_empty() && SENSITIVE_VARY_HEADERS.contains(&name.as_str()) {
                hash_value(value)
            } else {
                value.to_string()
            };
            key.push('|');
            key.push_str(&name);
            key.push('=');
            key.push_str(&value);
        }
        Self(key)
    }

    /// Key as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..16])
}

/// Stored form of a cached response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope {
    /// The cached response
    pub response: CachedResponse,
    /// Creation time, epoch millis
    pub created_at_ms: u64,
    /// Expiry time, epoch millis
    pub expires_at_ms: u64,
    /// Invalidation tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheEnvelope {
    /// Wrap a response with its lifetime
    #[must_use]
    pub fn new(response: CachedResponse, ttl: Duration, tags: Vec<String>) -> Self {
        let created_at_ms = epoch_millis();
        Self {
            response,
            created_at_ms,
            expires_at_ms: created_at_ms + ttl.as_millis() as u64,
            tags,
        }
    }

    /// Check if the entry is expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        epoch_millis() >= self.expires_at_ms
    }

    /// Get remaining TTL
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(epoch_millis()))
    }
}

#[derive(Debug)]
struct MemoryEntry {
    data: Vec<u8>,
    tags: Vec<String>,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    entries: HashMap<String, MemoryEntry>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl MemoryStore {
    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn remove_all(&mut self, keys: Vec<String>) -> u64 {
        keys.into_iter()
            .filter(|k| self.remove(k).is_some())
            .count() as u64
    }

    fn sweep_expired(&mut self, now: Instant) -> u64 {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        self.remove_all(expired)
    }

    fn evict_lowest_hits(&mut self, count: usize) {
        let mut by_hits: Vec<(String, u64, Instant)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.hit_count, e.created_at))
            .collect();
        by_hits.sort_by_key(|(_, hits, created)| (*hits, *created));
        let victims = by_hits.into_iter().take(count).map(|(k, _, _)| k).collect();
        self.remove_all(victims);
    }
}

/// In-memory cache backend (process-local tier)
pub struct MemoryCacheBackend {
    store: RwLock<MemoryStore>,
    max_entries: usize,
}

impl MemoryCacheBackend {
    /// Create a new memory cache backend
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: RwLock::new(MemoryStore::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of stored entries, expired ones included until swept
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    /// Hit count of a live entry
    pub async fn hit_count(&self, key: &str) -> Option<u64> {
        self.store.read().await.entries.get(key).map(|e| e.hit_count)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut store = self.store.write().await;

        match store.entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                return Ok(Some(entry.data.clone()));
            }
            Some(_) => {}
        }

        store.remove(key);
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()> {
        let now = Instant::now();
        let mut store = self.store.write().await;

        store.sweep_expired(now);
        store.remove(key);

        if store.entries.len() >= self.max_entries {
            let overflow = store.entries.len() + 1 - self.max_entries;
            store.evict_lowest_hits(overflow);
        }

        for tag in tags {
            store
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        store.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: value,
                tags: tags.to_vec(),
                created_at: now,
                expires_at: now + ttl,
                hit_count: 0,
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.store.write().await.remove(key).is_some())
    }

    async fn delete_by_tag(&self, tag: &str) -> CacheResult<u64> {
        let mut store = self.store.write().await;
        let keys: Vec<String> = store
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        Ok(store.remove_all(keys))
    }

    async fn delete_matching(&self, pattern: &Regex) -> CacheResult<u64> {
        let mut store = self.store.write().await;
        let keys: Vec<String> = store
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        Ok(store.remove_all(keys))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        Ok(self
            .store
            .read()
            .await
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now)))
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut store = self.store.write().await;
        store.entries.clear();
        store.tag_index.clear();
        Ok(())
    }

    async fn health_check(&self) -> CacheResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Configuration for the response cache
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Maximum entries in the local tier
    pub local_capacity: usize,
    /// Upper bound on how long a shared-tier hit stays in the local tier
    pub local_ttl: Duration,
    /// Bound on each shared-tier call
    pub shared_timeout: Duration,
    /// Headers that vary the key when a route does not name its own
    pub default_vary_by: Vec<String>,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_capacity: 10_000,
            local_ttl: Duration::from_secs(300),
            shared_timeout: Duration::from_secs(2),
            default_vary_by: vec!["authorization".to_string(), "accept".to_string()],
        }
    }
}

/// Statistics for the response cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Total hits across tiers
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Hits served by the local tier
    pub local_hits: u64,
    /// Hits served by the shared tier
    pub shared_hits: u64,
    /// Shared-tier failures swallowed
    pub shared_errors: u64,
    /// Entries currently in the local tier
    pub entries: usize,
}

impl CacheStats {
    /// Calculate overall hit rate
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    shared_errors: AtomicU64,
}

/// Response cache with a local tier and an optional shared tier
pub struct ResponseCache {
    config: ResponseCacheConfig,
    local: Arc<MemoryCacheBackend>,
    shared: Option<Arc<dyn CacheBackend>>,
    counters: CacheCounters,
}

impl ResponseCache {
    /// Create a local-only cache
    #[must_use]
    pub fn new(config: ResponseCacheConfig) -> Self {
        let local = Arc::new(MemoryCacheBackend::new(config.local_capacity));
        Self {
            config,
            local,
            shared: None,
            counters: CacheCounters::default(),
        }
    }

    /// Create with defaults (in-memory only)
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ResponseCacheConfig::default())
    }

    /// Create a disabled cache
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(ResponseCacheConfig {
            enabled: false,
            ..Default::default()
        })
    }

    /// Attach a shared tier
    #[must_use]
    pub fn with_shared(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        info!(backend = backend.name(), "Shared cache tier attached");
        self.shared = Some(backend);
        self
    }

    /// Check if caching is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check if a shared tier is attached
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.shared.as_ref().is_some_and(|b| b.is_distributed())
    }

    /// Vary-by headers for a route, falling back to the configured default
    #[must_use]
    pub fn vary_by<'a>(&'a self, route_vary_by: Option<&'a [String]>) -> &'a [String] {
        route_vary_by.unwrap_or(&self.config.default_vary_by)
    }

    fn uses_local(&self, strategy: CacheStrategy) -> bool {
        !matches!(strategy, CacheStrategy::Shared) || self.shared.is_none()
    }

    fn shared_for(&self, strategy: CacheStrategy) -> Option<&Arc<dyn CacheBackend>> {
        match strategy {
            CacheStrategy::Memory => None,
            CacheStrategy::Shared | CacheStrategy::Tiered => self.shared.as_ref(),
        }
    }

    /// Look up a response
    pub async fn get(&self, key: &CacheKey, strategy: CacheStrategy) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }

        if self.uses_local(strategy) {
            if let Some(envelope) = self.local_lookup(key).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Local cache hit");
                return Some(envelope.response);
            }
        }

        if let Some(shared) = self.shared_for(strategy) {
            if let Some((envelope, raw)) = self.shared_lookup(shared, key).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Shared cache hit");

                if self.uses_local(strategy) {
                    let ttl = self.config.local_ttl.min(envelope.remaining_ttl());
                    if !ttl.is_zero() {
                        let _ = self.local.set(key.as_str(), raw, ttl, &envelope.tags).await;
                    }
                }
                return Some(envelope.response);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss");
        None
    }

    async fn local_lookup(&self, key: &CacheKey) -> Option<CacheEnvelope> {
        let data = self.local.get(key.as_str()).await.ok().flatten()?;
        match serde_json::from_slice::<CacheEnvelope>(&data) {
            Ok(envelope) if !envelope.is_expired() => Some(envelope),
            Ok(_) => {
                let _ = self.local.delete(key.as_str()).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to deserialize local cache entry");
                let _ = self.local.delete(key.as_str()).await;
                None
            }
        }
    }

    async fn shared_lookup(
        &self,
        shared: &Arc<dyn CacheBackend>,
        key: &CacheKey,
    ) -> Option<(CacheEnvelope, Vec<u8>)> {
        let data = match self.bounded(shared.get(key.as_str())).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                self.shared_failed("get", &e);
                return None;
            }
        };

        match serde_json::from_slice::<CacheEnvelope>(&data) {
            Ok(envelope) if !envelope.is_expired() => Some((envelope, data)),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to deserialize shared cache entry");
                None
            }
        }
    }

    /// Store a response in the tiers the strategy selects
    pub async fn put(
        &self,
        key: &CacheKey,
        response: CachedResponse,
        ttl: Duration,
        tags: &[String],
        strategy: CacheStrategy,
    ) {
        if !self.config.enabled || ttl.is_zero() {
            return;
        }

        let envelope = CacheEnvelope::new(response, ttl, tags.to_vec());
        let data = match serde_json::to_vec(&envelope) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        if self.uses_local(strategy) {
            if let Err(e) = self.local.set(key.as_str(), data.clone(), ttl, tags).await {
                warn!(key = %key, error = %e, "Failed to store in local cache");
            }
        }

        if let Some(shared) = self.shared_for(strategy) {
            if let Err(e) = self.bounded(shared.set(key.as_str(), data, ttl, tags)).await {
                self.shared_failed("set", &e);
            }
        }

        debug!(key = %key, ttl_secs = ttl.as_secs(), "Response cached");
    }

    /// Whether a live entry exists in any tier
    pub async fn exists(&self, key: &CacheKey) -> bool {
        if self.local.exists(key.as_str()).await.unwrap_or(false) {
            return true;
        }
        match &self.shared {
            Some(shared) => match self.bounded(shared.exists(key.as_str())).await {
                Ok(found) => found,
                Err(e) => {
                    self.shared_failed("exists", &e);
                    false
                }
            },
            None => false,
        }
    }

    /// Remove one entry from every tier
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let mut removed = self.local.delete(key.as_str()).await.unwrap_or(false);
        if let Some(shared) = &self.shared {
            match self.bounded(shared.delete(key.as_str())).await {
                Ok(found) => removed |= found,
                Err(e) => self.shared_failed("delete", &e),
            }
        }
        removed
    }

    /// Remove every entry tagged `tag`, returning the larger per-tier count
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let local = self.local.delete_by_tag(tag).await.unwrap_or(0);
        let shared = match &self.shared {
            Some(shared) => match self.bounded(shared.delete_by_tag(tag)).await {
                Ok(count) => count,
                Err(e) => {
                    self.shared_failed("delete_by_tag", &e);
                    0
                }
            },
            None => 0,
        };
        let removed = local.max(shared);
        info!(tag = %tag, removed = removed, "Cache invalidated by tag");
        removed
    }

    /// Remove every entry whose key matches the regular expression
    ///
    /// # Errors
    /// Returns `InvalidPattern` when the expression does not compile
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let regex = Regex::new(pattern).map_err(|e| CacheError::InvalidPattern(e.to_string()))?;
        Ok(self.invalidate_matching(&regex).await)
    }

    /// Remove every entry for a path, across methods and vary-by values
    pub async fn invalidate_path(&self, path: &str) -> u64 {
        let normalized = gateway_core::normalize_path(path);
        let pattern = format!(r"^[A-Z]+:{}(\?|\||$)", regex::escape(&normalized));
        match Regex::new(&pattern) {
            Ok(regex) => self.invalidate_matching(&regex).await,
            Err(_) => 0,
        }
    }

    /// Remove every entry for a method
    pub async fn invalidate_method(&self, method: HttpMethod) -> u64 {
        match Regex::new(&format!("^{}:", method.as_str())) {
            Ok(regex) => self.invalidate_matching(&regex).await,
            Err(_) => 0,
        }
    }

    async fn invalidate_matching(&self, regex: &Regex) -> u64 {
        let local = self.local.delete_matching(regex).await.unwrap_or(0);
        let shared = match &self.shared {
            Some(shared) => match self.bounded(shared.delete_matching(regex)).await {
                Ok(count) => count,
                Err(e) => {
                    self.shared_failed("delete_matching", &e);
                    0
                }
            },
            None => 0,
        };
        let removed = local.max(shared);
        info!(pattern = %regex, removed = removed, "Cache invalidated by pattern");
        removed
    }

    /// Clear all cache entries
    pub async fn clear(&self) {
        let _ = self.local.clear().await;
        if let Some(shared) = &self.shared {
            if let Err(e) = self.bounded(shared.clear()).await {
                self.shared_failed("clear", &e);
            }
        }
        info!("Response cache cleared");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            shared_errors: self.counters.shared_errors.load(Ordering::Relaxed),
            entries: self.local.len().await,
        }
    }

    /// Health check for the shared tier
    ///
    /// # Errors
    /// Returns the shared tier's error
    pub async fn health_check(&self) -> CacheResult<()> {
        if let Some(shared) = &self.shared {
            self.bounded(shared.health_check()).await?;
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.config.shared_timeout, fut)
            .await
            .unwrap_or(Err(CacheError::Timeout(self.config.shared_timeout)))
    }

    fn shared_failed(&self, operation: &str, err: &CacheError) {
        self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
        warn!(operation = operation, error = %err, "Shared cache tier failed, continuing with local tier");
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("enabled", &self.config.enabled)
            .field("shared", &self.shared.as_ref().map(|b| b.name()))
            .finish()
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
