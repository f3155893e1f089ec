//! Route definitions for the gateway API.

use axum::{
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use gateway_config::CorsSettings;
use gateway_core::GatewayError;
use std::any::Any;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::{error::ApiError, handlers, state::AppState};

/// Create the main router: gateway endpoints plus the proxy fallback
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors);
    let sanitize = state.config.environment.is_production();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/backends", get(handlers::backend_health))
        .route("/metrics", get(handlers::metrics_endpoint))
        .fallback(handlers::proxy)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors)
                .layer(CatchPanicLayer::custom(
                    move |payload: Box<dyn Any + Send + 'static>| panic_response(payload, sanitize),
                )),
        )
        .with_state(state)
}

/// A panicking request becomes the standard 500 error body
fn panic_response(payload: Box<dyn Any + Send + 'static>, sanitize: bool) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %detail, "Request handler panicked");

    let err = GatewayError::internal(format!("Request handler panicked: {detail}"));
    ApiError::from_gateway(&err, sanitize).into_response()
}

/// CORS from configuration; `*` allows any origin without credentials
pub fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    if settings.origins.iter().any(|o| o == "*") {
        if settings.allow_credentials {
            warn!("CORS credentials cannot be combined with a wildcard origin; ignoring");
        }
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = settings
        .origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(settings.allow_credentials)
}
