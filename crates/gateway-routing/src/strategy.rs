//! Instance selection algorithms.

use crate::load_balancer::Instance;
use gateway_core::GatewayError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load balancing algorithm for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingAlgorithm {
    /// Cycle through healthy instances
    #[default]
    RoundRobin,
    /// Fewest in-flight requests
    LeastConnections,
    /// Random, proportional to weight
    Weighted,
    /// Stable per client IP
    IpHash,
}

impl BalancingAlgorithm {
    /// Kebab-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::Weighted => "weighted",
            Self::IpHash => "ip-hash",
        }
    }

    /// Pick one of `healthy`, which must be non-empty
    ///
    /// `cursor` is the backend's round-robin position. IP hash without a client
    /// address falls back to round-robin.
    #[must_use]
    pub fn select(
        &self,
        healthy: &[Arc<Instance>],
        cursor: &AtomicUsize,
        client_ip: Option<&str>,
    ) -> Option<Arc<Instance>> {
        if healthy.is_empty() {
            return None;
        }

        let index = match self {
            Self::RoundRobin => round_robin(healthy.len(), cursor),
            Self::LeastConnections => least_connections(healthy),
            Self::Weighted => weighted(healthy),
            Self::IpHash => match client_ip {
                Some(ip) => ip_hash(ip, healthy.len()),
                None => round_robin(healthy.len(), cursor),
            },
        };
        healthy.get(index).cloned()
    }
}

impl fmt::Display for BalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancingAlgorithm {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least-connections" | "leastconnections" => Ok(Self::LeastConnections),
            "weighted" | "weighted-round-robin" => Ok(Self::Weighted),
            "ip-hash" | "iphash" => Ok(Self::IpHash),
            other => Err(GatewayError::validation_field(
                format!("Unknown load balancing algorithm: {other}"),
                "algorithm",
            )),
        }
    }
}

fn round_robin(len: usize, cursor: &AtomicUsize) -> usize {
    cursor.fetch_add(1, Ordering::Relaxed) % len
}

fn least_connections(healthy: &[Arc<Instance>]) -> usize {
    healthy
        .iter()
        .enumerate()
        .min_by_key(|(_, instance)| instance.active_connections())
        .map_or(0, |(i, _)| i)
}

fn weighted(healthy: &[Arc<Instance>]) -> usize {
    let total: u64 = healthy.iter().map(|i| u64::from(i.weight().max(1))).sum();
    let mut pick = rand::thread_rng().gen_range(0..total);
    for (i, instance) in healthy.iter().enumerate() {
        let weight = u64::from(instance.weight().max(1));
        if pick < weight {
            return i;
        }
        pick -= weight;
    }
    0
}

fn ip_hash(ip: &str, len: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() % len as u64) as usize
}
