//! # Gateway Routing
//!
//! Request routing and load balancing for the API gateway.
//!
//! This crate provides:
//! - Exact (method, path) route resolution over a swappable snapshot
//! - Backend pools with round-robin, least-connections, weighted and ip-hash selection
//! - Connection accounting through RAII guards
//! - Periodic instance health probing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod health;
pub mod load_balancer;
pub mod resolver;
pub mod strategy;

// Re-export main types
pub use health::{HealthProber, HealthProberConfig, ProbeSummary};
pub use load_balancer::{
    BackendPool, ConnectionGuard, Instance, InstanceSnapshot, LoadBalancer, PoolStats,
    DEFAULT_HEALTH_PATH,
};
pub use resolver::{InMemoryRouteStore, RouteResolver, RouteStore};
pub use strategy::BalancingAlgorithm;
