//! Backend pools, instance health and connection accounting.
//!
//! Each backend owns an ordered list of instances. Selection only ever
//! considers healthy instances; when none are healthy the balancer returns
//! `NoHealthyInstance` and the dispatcher answers 503.

use crate::strategy::BalancingAlgorithm;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use gateway_core::GatewayError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default path probed on each instance
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// One `host:port` endpoint of a backend
#[derive(Debug)]
pub struct Instance {
    scheme: String,
    host: String,
    port: u16,
    weight: u32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    last_health_check_ms: AtomicU64,
}

impl Instance {
    /// Create a healthy `http` instance with weight 1
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
            weight: 1,
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            last_health_check_ms: AtomicU64::new(0),
        }
    }

    /// Parse `scheme://host:port`
    ///
    /// # Errors
    /// Returns a validation error when the URL has no host
    pub fn from_url(raw: &str) -> Result<Self, GatewayError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| GatewayError::validation_field(format!("Invalid instance URL '{raw}': {e}"), "url"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::validation_field(format!("Instance URL '{raw}' has no host"), "url"))?;
        let port = parsed.port_or_known_default().unwrap_or(80);
        Ok(Self::new(host, port).with_scheme(parsed.scheme()))
    }

    /// Set the selection weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Set the scheme (`http` or `https`)
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Host name or address
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Selection weight
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Whether the last probe succeeded
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a probe result, returning the previous health
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.last_health_check_ms
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Requests currently in flight
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Time of the last probe
    #[must_use]
    pub fn last_health_check_at(&self) -> Option<DateTime<Utc>> {
        match self.last_health_check_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms as i64).single(),
        }
    }

    pub(crate) fn begin_request(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Serializable view
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            url: self.url(),
            weight: self.weight,
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            last_health_check_at: self.last_health_check_at(),
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    /// Base URL
    pub url: String,
    /// Selection weight
    pub weight: u32,
    /// Health flag
    pub healthy: bool,
    /// In-flight requests
    pub active_connections: usize,
    /// Last probe time
    pub last_health_check_at: Option<DateTime<Utc>>,
}

/// Holds an in-flight slot on an instance; released on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    instance: Arc<Instance>,
}

impl ConnectionGuard {
    fn new(instance: Arc<Instance>) -> Self {
        instance.begin_request();
        Self { instance }
    }

    /// The selected instance
    #[must_use]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.end_request();
    }
}

/// Instances of one backend plus its selection state
#[derive(Debug)]
pub struct BackendPool {
    name: String,
    algorithm: BalancingAlgorithm,
    health_path: String,
    instances: RwLock<Vec<Arc<Instance>>>,
    cursor: AtomicUsize,
    /// Serializes pick-and-increment for least-connections
    acquire_lock: Mutex<()>,
}

impl BackendPool {
    fn new(name: String, algorithm: BalancingAlgorithm, health_path: String) -> Self {
        Self {
            name,
            algorithm,
            health_path,
            instances: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            acquire_lock: Mutex::new(()),
        }
    }

    /// Backend name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selection algorithm
    #[must_use]
    pub fn algorithm(&self) -> BalancingAlgorithm {
        self.algorithm
    }

    /// Path probed by the health checker
    #[must_use]
    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    /// All instances, in insertion order
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().clone()
    }

    fn healthy(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    fn find(&self, host: &str, port: u16) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.host() == host && i.port() == port)
            .cloned()
    }

    /// Counts for monitoring
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let instances = self.instances.read();
        let healthy = instances.iter().filter(|i| i.is_healthy()).count();
        PoolStats {
            backend: self.name.clone(),
            algorithm: self.algorithm,
            total: instances.len(),
            healthy,
            unhealthy: instances.len() - healthy,
            total_connections: instances.iter().map(|i| i.active_connections()).sum(),
        }
    }
}

/// Pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Backend name
    pub backend: String,
    /// Selection algorithm
    pub algorithm: BalancingAlgorithm,
    /// Instances configured
    pub total: usize,
    /// Instances passing health checks
    pub healthy: usize,
    /// Instances failing health checks
    pub unhealthy: usize,
    /// Requests in flight across instances
    pub total_connections: usize,
}

/// Backend pools keyed by name
#[derive(Debug, Default)]
pub struct LoadBalancer {
    pools: DashMap<String, Arc<BackendPool>>,
    default_algorithm: BalancingAlgorithm,
}

impl LoadBalancer {
    /// Create a balancer; pools added without an explicit algorithm use `default_algorithm`
    #[must_use]
    pub fn new(default_algorithm: BalancingAlgorithm) -> Self {
        Self {
            pools: DashMap::new(),
            default_algorithm,
        }
    }

    /// Register a backend, replacing any existing pool of that name
    pub fn add_backend(
        &self,
        name: impl Into<String>,
        algorithm: Option<BalancingAlgorithm>,
        health_path: Option<String>,
    ) -> Arc<BackendPool> {
        let name = name.into();
        let algorithm = algorithm.unwrap_or(self.default_algorithm);
        let pool = Arc::new(BackendPool::new(
            name.clone(),
            algorithm,
            health_path.unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
        ));
        info!(backend = %name, algorithm = %algorithm, "Registered backend");
        self.pools.insert(name, Arc::clone(&pool));
        pool
    }

    /// Add an instance, registering the backend if needed
    pub fn add_instance(&self, backend: &str, instance: Instance) -> Arc<Instance> {
        let pool = match self.pools.get(backend) {
            Some(pool) => Arc::clone(pool.value()),
            None => self.add_backend(backend, None, None),
        };
        let instance = Arc::new(instance);
        info!(backend = %backend, instance = %instance.address(), "Added backend instance");
        pool.instances.write().push(Arc::clone(&instance));
        instance
    }

    /// Remove an instance; in-flight guards keep it alive until they drop
    pub fn remove_instance(&self, backend: &str, host: &str, port: u16) -> bool {
        let Some(pool) = self.pool(backend) else {
            return false;
        };
        let mut instances = pool.instances.write();
        let before = instances.len();
        instances.retain(|i| !(i.host() == host && i.port() == port));
        let removed = instances.len() < before;
        if removed {
            info!(backend = %backend, instance = %format!("{host}:{port}"), "Removed backend instance");
        }
        removed
    }

    /// Pool for a backend
    #[must_use]
    pub fn pool(&self, backend: &str) -> Option<Arc<BackendPool>> {
        self.pools.get(backend).map(|p| Arc::clone(p.value()))
    }

    /// Every pool, sorted by name
    #[must_use]
    pub fn pools(&self) -> Vec<Arc<BackendPool>> {
        let mut pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Registered backend names, sorted
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        self.pools().iter().map(|p| p.name.clone()).collect()
    }

    /// Select an instance for a backend
    ///
    /// A backend name that is itself an absolute URL and has no pool is
    /// registered on first use as a single-instance pool.
    pub fn next_instance(
        &self,
        backend: &str,
        client_ip: Option<&str>,
    ) -> Result<Arc<Instance>, GatewayError> {
        let pool = self.resolve_pool(backend)?;
        Self::pick(&pool, backend, client_ip)
    }

    /// Select an instance and take an in-flight slot on it
    ///
    /// Under least-connections the pick and the increment happen under the
    /// pool's lock, so concurrent callers see each other's slots.
    pub fn acquire(
        &self,
        backend: &str,
        client_ip: Option<&str>,
    ) -> Result<ConnectionGuard, GatewayError> {
        let pool = self.resolve_pool(backend)?;
        let _serial = (pool.algorithm == BalancingAlgorithm::LeastConnections)
            .then(|| pool.acquire_lock.lock());
        Self::pick(&pool, backend, client_ip).map(ConnectionGuard::new)
    }

    fn resolve_pool(&self, backend: &str) -> Result<Arc<BackendPool>, GatewayError> {
        self.pool(backend)
            .or_else(|| self.register_url_backend(backend))
            .ok_or_else(|| GatewayError::no_healthy_instance(backend))
    }

    fn pick(
        pool: &BackendPool,
        backend: &str,
        client_ip: Option<&str>,
    ) -> Result<Arc<Instance>, GatewayError> {
        let healthy = pool.healthy();
        match pool.algorithm.select(&healthy, &pool.cursor, client_ip) {
            Some(instance) => {
                debug!(backend = %backend, instance = %instance.address(), "Selected instance");
                Ok(instance)
            }
            None => {
                warn!(backend = %backend, "No healthy instances available");
                Err(GatewayError::no_healthy_instance(backend))
            }
        }
    }

    /// Set an instance's health flag; returns false when it is unknown
    pub fn mark_health(&self, backend: &str, host: &str, port: u16, healthy: bool) -> bool {
        match self.pool(backend).and_then(|p| p.find(host, port)) {
            Some(instance) => {
                instance.set_healthy(healthy);
                true
            }
            None => false,
        }
    }

    /// Counters for one backend
    #[must_use]
    pub fn stats(&self, backend: &str) -> Option<PoolStats> {
        self.pool(backend).map(|p| p.stats())
    }

    /// Counters for every backend
    #[must_use]
    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pools().iter().map(|p| p.stats()).collect()
    }

    fn register_url_backend(&self, backend: &str) -> Option<Arc<BackendPool>> {
        if !(backend.starts_with("http://") || backend.starts_with("https://")) {
            return None;
        }
        let instance = Instance::from_url(backend).ok()?;
        let entry = self.pools.entry(backend.to_string()).or_insert_with(|| {
            let pool = BackendPool::new(
                backend.to_string(),
                self.default_algorithm,
                DEFAULT_HEALTH_PATH.to_string(),
            );
            pool.instances.write().push(Arc::new(instance));
            Arc::new(pool)
        });
        Some(Arc::clone(entry.value()))
    }
}
