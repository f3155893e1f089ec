//! # Gateway Core
//!
//! Core types and error handling for the API gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Error taxonomy with HTTP status mapping
//! - Route definitions with rate-limit, cache and rewrite policies
//! - Caller identities
//! - Request and response types for the dispatch pipeline

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod request;
pub mod route;

// Re-export commonly used types
pub use error::{ceil_secs, GatewayError, GatewayResult};
pub use identity::{Identity, IdentitySource};
pub use request::{CachedResponse, GatewayRequest, GatewayResponse};
pub use route::{
    normalize_path, CachePolicy, CacheStrategy, HttpMethod, PathRewrite, RateLimitPolicy,
    RateLimitScope, Route,
};
