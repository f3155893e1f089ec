//! HTTP rendering of gateway errors.

use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::GatewayError;
use serde::Serialize;
use tracing::{error, warn};

const SANITIZED_MESSAGE: &str = "Internal Server Error";

/// Error body: `{"error": title, "message": detail}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Short title
    pub error: String,
    /// Detail
    pub message: String,
    /// Seconds to wait before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Error returned from handlers and rendered as JSON
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    title: String,
    message: String,
    retry_after: Option<u64>,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ApiError {
    /// Create an error with an explicit status
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
            retry_after: None,
            headers: Vec::new(),
        }
    }

    /// 400
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    /// 401
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    /// 404
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 503
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
    }

    /// 500
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// Render a pipeline error; internals are hidden when `sanitize` is set
    #[must_use]
    pub fn from_gateway(err: &GatewayError, sanitize: bool) -> Self {
        let message = if sanitize && err.is_sensitive() {
            SANITIZED_MESSAGE.to_string()
        } else {
            gateway_message(err)
        };
        Self {
            status: err.status_code(),
            code: err.error_code(),
            title: err.title().to_string(),
            message,
            retry_after: err.retry_after(),
            headers: Vec::new(),
        }
    }

    /// Attach an extra response header; invalid pairs are dropped
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.push((name, value));
        }
        self
    }

    /// HTTP status
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Detail message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Client-facing message for a pipeline error
fn gateway_message(err: &GatewayError) -> String {
    match err {
        GatewayError::RouteNotFound { method, path } => format!("No route for {method} {path}"),
        GatewayError::Authentication { message }
        | GatewayError::Authorization { message }
        | GatewayError::Upstream { message }
        | GatewayError::Configuration { message }
        | GatewayError::Internal { message }
        | GatewayError::Validation { message, .. } => message.clone(),
        GatewayError::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
        GatewayError::CircuitOpen { .. } => {
            "Service temporarily unavailable due to circuit breaker".to_string()
        }
        GatewayError::NoHealthyInstance { .. } => "No healthy upstream available".to_string(),
        GatewayError::UpstreamTimeout { .. } => "Request timeout".to_string(),
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self::from_gateway(&err, false)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), code = self.code, message = %self.message, "Request failed");
        } else {
            warn!(status = self.status.as_u16(), code = self.code, message = %self.message, "Request rejected");
        }

        let body = ErrorBody {
            error: self.title,
            message: self.message,
            retry_after: self.retry_after,
        };
        let mut response = (self.status, Json(body)).into_response();
        let headers = response.headers_mut();

        if let Some(retry_after) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        if self.status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        for (name, value) in self.headers {
            headers.insert(name, value);
        }
        response
    }
}
