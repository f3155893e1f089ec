//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant maps to exactly one HTTP status. Stages return these errors and
//! the server crate renders them; no stage builds HTTP responses for failures
//! on its own.

use http::StatusCode;
use std::time::Duration;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// No active route matches the request
    #[error("Route not found: {method} {path}")]
    RouteNotFound {
        /// Request method
        method: String,
        /// Normalized request path
        path: String,
    },

    /// Missing or invalid credential on a route that requires one
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Failure detail
        message: String,
    },

    /// Identity lacks a required role or scope
    #[error("Access denied: {message}")]
    Authorization {
        /// Failure detail
        message: String,
    },

    /// Quota for the current window is spent
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        /// Seconds until the window resets
        retry_after_secs: u64,
        /// Configured limit
        limit: u64,
        /// Window end as epoch milliseconds
        reset_at_ms: u64,
    },

    /// Backend circuit is open
    #[error("Circuit breaker is open for backend '{backend}'")]
    CircuitOpen {
        /// Backend name
        backend: String,
        /// Seconds until a probe will be admitted
        retry_after_secs: u64,
    },

    /// Every instance of the backend is unhealthy
    #[error("No healthy instance available for backend '{backend}'")]
    NoHealthyInstance {
        /// Backend name
        backend: String,
    },

    /// Connection-level failure talking to the backend
    #[error("Upstream error: {message}")]
    Upstream {
        /// Failure detail
        message: String,
    },

    /// Backend exceeded the route's time budget
    #[error("Upstream timed out after {}ms", timeout.as_millis())]
    UpstreamTimeout {
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// Malformed request
    #[error("Validation error: {message}")]
    Validation {
        /// Failure detail
        message: String,
        /// Offending field, if known
        field: Option<String>,
    },

    /// Invalid gateway configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Failure detail
        message: String,
    },

    /// Anything unexpected
    #[error("Internal error: {message}")]
    Internal {
        /// Failure detail
        message: String,
    },
}

impl GatewayError {
    /// Create a route-not-found error
    pub fn route_not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create an authorization error
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open(backend: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            backend: backend.into(),
            retry_after_secs: ceil_secs(retry_after),
        }
    }

    /// Create a no-healthy-instance error
    pub fn no_healthy_instance(backend: impl Into<String>) -> Self {
        Self::NoHealthyInstance {
            backend: backend.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } | Self::NoHealthyInstance { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Validation { .. } => "validation_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Short title rendered in the `error` field of response bodies
    #[must_use]
    pub fn title(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "Route not found",
            Self::Authentication { .. } => "Unauthorized",
            Self::Authorization { .. } => "Forbidden",
            Self::RateLimitExceeded { .. } => "Too Many Requests",
            Self::CircuitOpen { .. } | Self::NoHealthyInstance { .. } => "Service Unavailable",
            Self::Upstream { .. } => "Bad Gateway",
            Self::UpstreamTimeout { .. } => "Gateway Timeout",
            Self::Validation { .. } => "Bad Request",
            Self::Configuration { .. } | Self::Internal { .. } => "Internal Server Error",
        }
    }

    /// Seconds the client should wait before retrying, if applicable
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs, ..
            }
            | Self::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Whether the error is caused by the client
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Whether the error hides internals outside development
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Internal { .. })
    }
}

/// Round a duration up to whole seconds, never below one
#[must_use]
pub fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}
