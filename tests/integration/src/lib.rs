//! Integration tests for the API gateway
//!
//! Each test runs a real gateway on an ephemeral port in front of wiremock
//! backends and talks to it over HTTP:
//! - Routing, rewriting and load balancing
//! - Authentication
//! - Rate limiting
//! - Circuit breaking
//! - Response caching
//! - Upstream failure mapping

pub mod fixtures;
pub mod helpers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;

#[cfg(test)]
mod auth_tests;
#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod circuit_breaker_tests;
#[cfg(test)]
mod rate_limit_tests;
#[cfg(test)]
mod routing_tests;
#[cfg(test)]
mod upstream_tests;
