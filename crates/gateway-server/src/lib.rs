//! # Gateway Server
//!
//! HTTP surface of the API gateway.
//!
//! This crate provides:
//! - The request pipeline (resolve, auth, rate limit, cache, circuit, balance)
//! - The proxy dispatcher with pre/post/error hooks
//! - JWT and API key authentication
//! - Health and metrics endpoints
//! - Graceful shutdown handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod health;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

// Re-export main types
pub use auth::{
    extract_credential, hash_api_key, ApiKeyRecord, AuthError, AuthOutcome, Authenticator,
    Claims, CredentialStore, InMemoryCredentialStore, TokenType, UserRecord,
};
pub use dispatcher::{DispatchHooks, Dispatcher, ForwardRequest, GatewayHeaders};
pub use error::ApiError;
pub use health::{BackendHealth, BackendHealthReport, HealthStatus, LivenessResponse};
pub use pipeline::{CacheStatus, Outcome, Pipeline, RequestContext, Stage};
pub use routes::create_router;
pub use server::{Server, ServerConfig, ServerError};
pub use shutdown::{shutdown_signal, RequestGuard, ShutdownCoordinator};
pub use state::{AppState, AppStateBuilder};
