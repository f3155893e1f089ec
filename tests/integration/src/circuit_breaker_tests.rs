//! Circuit breaker integration tests

use crate::fixtures::*;
use crate::helpers::*;
use gateway_resilience::CircuitState;
use pretty_assertions::assert_eq;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A backend that fails `failures` times and then recovers
async fn flaky_backend(failures: u64) -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(failures)
        .with_priority(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .with_priority(2)
        .mount(&upstream)
        .await;
    upstream
}

async fn breaker_gateway(upstream: &MockServer) -> TestGateway {
    let mut config = config_with(
        backend_for("orders", &[upstream]),
        vec![get_route("orders", "/orders", "orders")],
    );
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout = Duration::from_millis(200);
    TestGateway::start(config).await
}

/// Upstream 5xx responses pass through until the threshold opens the circuit
#[tokio::test]
async fn test_circuit_opens_after_threshold() {
    let upstream = flaky_backend(3).await;
    let gateway = breaker_gateway(&upstream).await;

    for _ in 0..3 {
        assert_status(&gateway.get("/orders").await, 500);
    }

    let rejected = gateway.get("/orders").await;
    assert_status(&rejected, 503);
    assert!(header(&rejected, "retry-after").is_some());
    let body = TestGateway::json_body(rejected).await;
    assert_eq!(body["error"], "Service Unavailable");

    let breaker = gateway.state.breakers.get("orders").expect("breaker");
    assert_eq!(breaker.state(), CircuitState::Open);

    // the rejected request never reached the backend
    assert_eq!(upstream.received_requests().await.map(|r| r.len()), Some(3));
}

/// After the recovery timeout a successful probe closes the circuit
#[tokio::test]
async fn test_circuit_recovers() {
    let upstream = flaky_backend(3).await;
    let gateway = breaker_gateway(&upstream).await;

    for _ in 0..3 {
        gateway.get("/orders").await;
    }
    assert_status(&gateway.get("/orders").await, 503);

    let report = TestGateway::json_body(gateway.get("/health/backends").await).await;
    assert_eq!(report["status"], "degraded");
    assert_eq!(report["backends"][0]["circuit"], "open");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let probe = gateway.get("/orders").await;
    assert_status(&probe, 200);
    assert_eq!(probe.text().await.expect("body"), "recovered");

    let breaker = gateway.state.breakers.get("orders").expect("breaker");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_status(&gateway.get("/orders").await, 200);

    let report = TestGateway::json_body(gateway.get("/health/backends").await).await;
    assert_eq!(report["status"], "healthy");
}

/// A failed probe sends the circuit straight back to open
#[tokio::test]
async fn test_failed_probe_reopens() {
    let upstream = flaky_backend(4).await;
    let gateway = breaker_gateway(&upstream).await;

    for _ in 0..3 {
        gateway.get("/orders").await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_status(&gateway.get("/orders").await, 500);
    assert_status(&gateway.get("/orders").await, 503);
    let breaker = gateway.state.breakers.get("orders").expect("breaker");
    assert_eq!(breaker.state(), CircuitState::Open);
}

/// Transitions are exported as a gauge
#[tokio::test]
async fn test_circuit_state_metric() {
    let upstream = flaky_backend(3).await;
    let gateway = breaker_gateway(&upstream).await;

    for _ in 0..3 {
        gateway.get("/orders").await;
    }

    let metrics = gateway.get("/metrics").await.text().await.expect("body");
    assert!(metrics.contains("gateway_circuit_state{backend=\"orders\"} 2"));
}
