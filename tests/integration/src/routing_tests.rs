//! Routing and load balancing integration tests

use crate::fixtures::*;
use crate::helpers::*;
use gateway_core::{HttpMethod, PathRewrite, Route};
use gateway_routing::{HealthProber, HealthProberConfig};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Unmatched paths never reach a backend
#[tokio::test]
async fn test_unknown_route_is_404() {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("users", "/users", "svc")],
    ))
    .await;

    let response = gateway.get("/orders").await;
    assert_status(&response, 404);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"], "Route not found");
}

/// Trailing slashes and duplicate separators resolve to the same route
#[tokio::test]
async fn test_paths_are_normalized() {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("users", "/users", "svc")],
    ))
    .await;

    assert_status(&gateway.get("/users/").await, 200);
    assert_status(&gateway.get("//users").await, 200);
}

/// A route registered for GET does not answer POST
#[tokio::test]
async fn test_method_must_match() {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("users", "/users", "svc")],
    ))
    .await;

    let response = gateway.post_json("/users", &json!({})).await;
    assert_status(&response, 404);
}

/// Higher priority wins; inactive routes never match
#[tokio::test]
async fn test_route_priority_and_active_flag() {
    let low = backend(200, "low").await;
    let high = backend(200, "high").await;

    let mut config = test_config();
    config.backends.push(backend_for("low", &[&low]));
    config.backends.push(backend_for("high", &[&high]));
    config.routes = vec![
        get_route("x-low", "/x", "low").with_priority(1),
        get_route("x-high", "/x", "high").with_priority(2),
        get_route("x-inactive", "/x", "low").with_priority(10).with_active(false),
    ];
    let gateway = TestGateway::start(config).await;

    for _ in 0..3 {
        let response = gateway.get("/x").await;
        assert_status(&response, 200);
        assert_eq!(response.text().await.expect("body"), "high");
    }
}

/// Rewrites, injected headers, query strings and bodies reach the backend
#[tokio::test]
async fn test_request_is_rewritten_and_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(query_param("dry_run", "true"))
        .and(header("x-tenant", "acme"))
        .and(header("x-gateway-route", "orders-create"))
        .and(body_json(json!({"sku": "A-1", "qty": 2})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&upstream)
        .await;

    let route = Route::new("orders-create", "/api/v1/orders", HttpMethod::Post, "orders")
        .with_rewrite(PathRewrite::new("^/api/v1", "/v2"))
        .with_header("x-tenant", "acme");
    let gateway = TestGateway::start(config_with(backend_for("orders", &[&upstream]), vec![route])).await;

    let response = gateway
        .client
        .post(gateway.url("/api/v1/orders?dry_run=true"))
        .json(&json!({"sku": "A-1", "qty": 2}))
        .send()
        .await
        .expect("Request failed");
    assert_status(&response, 201);
    assert_eq!(TestGateway::json_body(response).await, json!({"id": 7}));
}

/// A route whose backend is a URL needs no pool definition
#[tokio::test]
async fn test_url_backend() {
    let upstream = backend(200, "direct").await;
    let mut config = test_config();
    config.routes = vec![get_route("direct", "/direct", &upstream.uri())];
    let gateway = TestGateway::start(config).await;

    let response = gateway.get("/direct").await;
    assert_status(&response, 200);
    assert_eq!(response.text().await.expect("body"), "direct");
}

/// Round robin cycles through instances in a fixed order
#[tokio::test]
async fn test_round_robin_cycles_instances() {
    let a = backend(200, "a").await;
    let b = backend(200, "b").await;
    let c = backend(200, "c").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&a, &b, &c]),
        vec![get_route("items", "/items", "svc")],
    ))
    .await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        let response = gateway.get("/items").await;
        assert_status(&response, 200);
        seen.push(response.text().await.expect("body"));
    }

    let first_cycle: HashSet<&String> = seen[..3].iter().collect();
    assert_eq!(first_cycle.len(), 3);
    assert_eq!(seen[..3], seen[3..]);
}

/// Instances that fail probes are skipped until they recover
#[tokio::test]
async fn test_unhealthy_instances_are_skipped() {
    let healthy = backend(200, "healthy").await;
    let failing = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_string("failing"))
        .mount(&failing)
        .await;

    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&healthy, &failing]),
        vec![get_route("items", "/items", "svc")],
    ))
    .await;

    let prober = HealthProber::new(
        Arc::clone(&gateway.state.balancer),
        HealthProberConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(2),
        },
    )
    .expect("prober");
    prober.probe_all().await;

    let stats = gateway.state.balancer.stats("svc").expect("pool");
    assert_eq!((stats.healthy, stats.unhealthy), (1, 1));

    for _ in 0..4 {
        let response = gateway.get("/items").await;
        assert_eq!(response.text().await.expect("body"), "healthy");
    }

    let report = TestGateway::json_body(gateway.get("/health/backends").await).await;
    assert_eq!(report["backends"][0]["unhealthy"], 1);
}

/// With every instance down the gateway answers 503 itself
#[tokio::test]
async fn test_no_healthy_instance_is_503() {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("items", "/items", "svc")],
    ))
    .await;
    for instance in gateway.state.balancer.pool("svc").expect("pool").instances() {
        instance.set_healthy(false);
    }

    let response = gateway.get("/items").await;
    assert_status(&response, 503);
    assert_status(&gateway.get("/health/backends").await, 503);
}
