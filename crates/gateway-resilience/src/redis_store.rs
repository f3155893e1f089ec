//! Redis-backed shared stores for multi-instance deployments.
//!
//! Both stores namespace their keys with a configurable prefix
//! (`api-gateway:` by default).

use crate::cache::{CacheBackend, CacheError, CacheResult};
use crate::rate_limiter::{now_millis, RateLimitDecision, RateLimitStore, RateLimitStoreError};
use async_trait::async_trait;
use gateway_core::ceil_secs;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use regex::Regex;
use std::time::Duration;
use tracing::info;

/// Fixed window anchored to the first INCR; PEXPIRE is set only when the key is created.
const FIXED_WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    ConnectionManager::new(client).await
}

fn redact(url: &str) -> String {
    url::Url::parse(url).map_or_else(
        |_| "<invalid>".to_string(),
        |mut parsed| {
            let _ = parsed.set_password(None);
            parsed.to_string()
        },
    )
}

/// Rate-limit counters in Redis
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    key_prefix: String,
    script: redis::Script,
}

impl RedisRateLimitStore {
    /// Connect to Redis
    ///
    /// # Errors
    /// Returns `Unavailable` if the connection cannot be established
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, RateLimitStoreError> {
        let conn = connect(url)
            .await
            .map_err(|e| RateLimitStoreError::Unavailable(e.to_string()))?;
        let key_prefix = key_prefix.into();
        info!(url = %redact(url), prefix = %key_prefix, "Redis rate-limit store connected");
        Ok(Self {
            conn,
            key_prefix,
            script: redis::Script::new(FIXED_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis() as u64;
        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(format!("{}ratelimit:{key}", self.key_prefix))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitStoreError::Backend(e.to_string()))?;

        let remaining_ms = u64::try_from(ttl_ms).unwrap_or(window_ms);
        let allowed = count <= limit;
        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms: now_millis() + remaining_ms,
            retry_after_secs: (!allowed).then(|| ceil_secs(Duration::from_millis(remaining_ms))),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitStoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(format!("{}ratelimit:{key}", self.key_prefix))
            .await
            .map_err(|e| RateLimitStoreError::Backend(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Shared cache tier in Redis
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisCacheBackend {
    /// Connect to Redis
    ///
    /// # Errors
    /// Returns `Connection` if the connection cannot be established
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> CacheResult<Self> {
        let conn = connect(url)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let key_prefix = key_prefix.into();
        info!(url = %redact(url), prefix = %key_prefix, "Redis cache backend connected");
        Ok(Self { conn, key_prefix })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}cache:{key}", self.key_prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.key_prefix)
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(backend_error)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete_keys(&self, keys: Vec<String>) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del(keys).await.map_err(backend_error)
    }
}

fn backend_error(err: redis::RedisError) -> CacheError {
    if err.is_timeout() {
        CacheError::Timeout(Duration::ZERO)
    } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        CacheError::Connection(err.to_string())
    } else {
        CacheError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(self.entry_key(key)).await.map_err(backend_error)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);
        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(&entry_key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .ignore();
        for tag in tags {
            pipe.cmd("SADD").arg(self.tag_key(tag)).arg(key).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(backend_error)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(self.entry_key(key)).await.map_err(backend_error)?;
        Ok(removed > 0)
    }

    async fn delete_by_tag(&self, tag: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        let tag_key = self.tag_key(tag);
        let members: Vec<String> = conn.smembers(&tag_key).await.map_err(backend_error)?;
        let keys: Vec<String> = members.iter().map(|k| self.entry_key(k)).collect();
        let removed = self.delete_keys(keys).await?;
        conn.del::<_, ()>(&tag_key).await.map_err(backend_error)?;
        Ok(removed)
    }

    async fn delete_matching(&self, pattern: &Regex) -> CacheResult<u64> {
        let prefix = self.entry_key("");
        let keys: Vec<String> = self
            .scan_keys(&format!("{prefix}*"))
            .await?
            .into_iter()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|bare| pattern.is_match(bare)))
            .collect();
        self.delete_keys(keys).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.entry_key(key)).await.map_err(backend_error)
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut keys = self.scan_keys(&format!("{}cache:*", self.key_prefix)).await?;
        keys.extend(self.scan_keys(&format!("{}tag:*", self.key_prefix)).await?);
        self.delete_keys(keys).await.map(|_| ())
    }

    async fn health_check(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(backend_error)
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_distributed(&self) -> bool {
        true
    }
}
