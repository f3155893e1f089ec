//! Configuration fixtures for integration tests

use gateway_config::{BackendSettings, GatewayConfig, InstanceSettings};
use gateway_core::{HttpMethod, Route};
use secrecy::Secret;
use wiremock::MockServer;

/// JWT secret used by every test gateway
pub const TEST_JWT_SECRET: &str = "integration-test-secret";

/// Base configuration: no background probing, tokens enabled
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.health_check.enabled = false;
    config.auth.jwt_secret = Some(Secret::new(TEST_JWT_SECRET.to_string()));
    config
}

/// A backend pool over the given mock servers
pub fn backend_for(name: &str, servers: &[&MockServer]) -> BackendSettings {
    BackendSettings {
        name: name.to_string(),
        algorithm: None,
        health_path: None,
        instances: servers
            .iter()
            .map(|s| InstanceSettings {
                url: s.uri(),
                weight: 1,
            })
            .collect(),
    }
}

/// A public GET route
pub fn get_route(id: &str, path: &str, backend: &str) -> Route {
    Route::new(id, path, HttpMethod::Get, backend)
}

/// Configuration with one backend and the given routes
pub fn config_with(backend: BackendSettings, routes: Vec<Route>) -> GatewayConfig {
    let mut config = test_config();
    config.backends.push(backend);
    config.routes = routes;
    config
}
