//! Gateway and backend health reporting.

use gateway_resilience::{CircuitBreakerRegistry, CircuitState};
use gateway_routing::{InstanceSnapshot, LoadBalancer};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Aggregate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every backend has a healthy instance and no circuit is open
    Healthy,
    /// All backends reachable, but at least one circuit is not closed
    Degraded,
    /// At least one backend has no healthy instance
    Unhealthy,
}

impl HealthStatus {
    /// Whether traffic can be served
    #[must_use]
    pub fn is_serving(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    /// HTTP status for this health status
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Liveness payload for `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    /// Always `healthy` while the process serves requests
    pub status: String,
    /// Package version
    pub version: String,
    /// Seconds since start
    pub uptime_seconds: u64,
}

/// Health of one backend pool
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Backend name
    pub name: String,
    /// Balancing algorithm
    pub algorithm: String,
    /// Instance count
    pub total: usize,
    /// Instances passing probes
    pub healthy: usize,
    /// Instances failing probes
    pub unhealthy: usize,
    /// Connections currently open through the gateway
    pub active_connections: usize,
    /// Breaker state, `closed` when no breaker exists yet
    pub circuit: CircuitState,
    /// Per-instance detail
    pub instances: Vec<InstanceSnapshot>,
}

/// Payload for `GET /health/backends`
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthReport {
    /// Aggregate status
    pub status: HealthStatus,
    /// Per-backend detail, sorted by name
    pub backends: Vec<BackendHealth>,
}

impl BackendHealthReport {
    /// Snapshot the balancer and breakers
    #[must_use]
    pub fn collect(balancer: &LoadBalancer, breakers: &CircuitBreakerRegistry) -> Self {
        let circuits: HashMap<String, CircuitState> = breakers.states().into_iter().collect();

        let mut backends: Vec<BackendHealth> = balancer
            .pools()
            .into_iter()
            .map(|pool| {
                let stats = pool.stats();
                BackendHealth {
                    name: stats.backend.clone(),
                    algorithm: stats.algorithm.to_string(),
                    total: stats.total,
                    healthy: stats.healthy,
                    unhealthy: stats.unhealthy,
                    active_connections: stats.total_connections,
                    circuit: circuits
                        .get(&stats.backend)
                        .copied()
                        .unwrap_or(CircuitState::Closed),
                    instances: pool.instances().iter().map(|i| i.snapshot()).collect(),
                }
            })
            .collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            status: aggregate(&backends),
            backends,
        }
    }
}

fn aggregate(backends: &[BackendHealth]) -> HealthStatus {
    if backends.iter().any(|b| b.healthy == 0) {
        HealthStatus::Unhealthy
    } else if backends.iter().any(|b| b.circuit != CircuitState::Closed) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
