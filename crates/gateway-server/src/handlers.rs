//! HTTP request handlers for the gateway API.

use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::GatewayRequest;
use tracing::debug;

use crate::{
    error::ApiError,
    extractors::{ClientIp, RequestId},
    health::{BackendHealthReport, LivenessResponse},
    state::AppState,
};

/// Gateway liveness
pub async fn health_check(State(state): State<AppState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Per-backend pool and circuit status; 503 when a backend has no healthy instance
pub async fn backend_health(State(state): State<AppState>) -> Response {
    let report = BackendHealthReport::collect(&state.balancer, &state.breakers);
    let status = StatusCode::from_u16(report.status.http_status_code())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report)).into_response()
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let metrics = state
        .metrics
        .gather()
        .map_err(|e| ApiError::internal(format!("Failed to encode metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response())
}

/// Everything that is not a gateway endpoint goes through the pipeline
pub async fn proxy(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    ClientIp(client_ip): ClientIp,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let limit = state.config.server.body_limit_bytes;
    let body = to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, limit = limit, "Failed to read request body");
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("Request body exceeds {limit} bytes"),
        )
    })?;

    let mut gateway_request = GatewayRequest::new(parts.method, parts.uri.path()).with_body(body);
    gateway_request.request_id = request_id;
    gateway_request.headers = parts.headers;
    gateway_request.query = parts.uri.query().map(String::from);
    gateway_request.client_ip = client_ip;

    Ok(state.dispatcher.dispatch(gateway_request).await)
}

