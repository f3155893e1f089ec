//! Rate limiting integration tests
//!
//! Quotas, headers, per-key isolation and the gateway-wide default limit.

use crate::fixtures::*;
use crate::helpers::*;
use gateway_core::{RateLimitPolicy, RateLimitScope};
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn limited_gateway(policy: RateLimitPolicy) -> (wiremock::MockServer, TestGateway) {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("search", "/search", "svc").with_rate_limit(policy)],
    ))
    .await;
    (upstream, gateway)
}

/// Fourth request inside the window is denied with a retry hint
#[tokio::test]
async fn test_limit_of_three() {
    let (_upstream, gateway) = limited_gateway(RateLimitPolicy::new(3, 60)).await;

    let mut statuses = Vec::new();
    let mut remaining = Vec::new();
    let mut last = None;
    for _ in 0..4 {
        let response = gateway.get_from("/search", "198.51.100.10").await;
        statuses.push(response.status().as_u16());
        remaining.push(header(&response, "x-ratelimit-remaining").unwrap_or_default().to_string());
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("3"));
        assert!(header(&response, "x-ratelimit-reset").is_some());
        last = Some(response);
    }

    assert_eq!(statuses, vec![200, 200, 200, 429]);
    assert_eq!(remaining, vec!["2", "1", "0", "0"]);

    let denied = last.expect("fourth response");
    let retry_after: u64 = header(&denied, "retry-after")
        .and_then(|v| v.parse().ok())
        .expect("retry-after should be set");
    assert!(retry_after > 0 && retry_after <= 60);

    let body = TestGateway::json_body(denied).await;
    assert_eq!(body["error"], "Too Many Requests");
}

/// IP-scoped counters are independent per client
#[tokio::test]
async fn test_clients_are_counted_separately() {
    let (_upstream, gateway) = limited_gateway(RateLimitPolicy::new(1, 60)).await;

    assert_status(&gateway.get_from("/search", "198.51.100.1").await, 200);
    assert_status(&gateway.get_from("/search", "198.51.100.1").await, 429);
    assert_status(&gateway.get_from("/search", "198.51.100.2").await, 200);
}

/// A global limit is shared by every caller
#[tokio::test]
async fn test_global_scope_is_shared() {
    let policy = RateLimitPolicy::new(2, 60).with_scope(RateLimitScope::Global);
    let (_upstream, gateway) = limited_gateway(policy).await;

    assert_status(&gateway.get_from("/search", "198.51.100.1").await, 200);
    assert_status(&gateway.get_from("/search", "198.51.100.2").await, 200);
    assert_status(&gateway.get_from("/search", "198.51.100.3").await, 429);
}

/// The window restarts once it has passed
#[tokio::test]
async fn test_window_resets() {
    let (_upstream, gateway) = limited_gateway(RateLimitPolicy::new(1, 1)).await;

    assert_status(&gateway.get_from("/search", "198.51.100.4").await, 200);
    assert_status(&gateway.get_from("/search", "198.51.100.4").await, 429);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let response = gateway.get_from("/search", "198.51.100.4").await;
    assert_status(&response, 200);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
}

/// Concurrent requests never exceed the quota
#[tokio::test]
async fn test_concurrent_requests_respect_limit() {
    let (_upstream, gateway) = limited_gateway(RateLimitPolicy::new(5, 60)).await;

    let requests = (0..20).map(|_| {
        let client = gateway.client.clone();
        let url = gateway.url("/search");
        async move {
            client
                .get(url)
                .header("x-forwarded-for", "198.51.100.99")
                .send()
                .await
                .expect("Request failed")
                .status()
                .as_u16()
        }
    });
    let statuses = futures::future::join_all(requests).await;

    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 5);
    assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 15);
}

/// The default limit applies to routes without their own when enabled
#[tokio::test]
async fn test_default_limit_applies_to_all_routes() {
    let upstream = backend(200, "ok").await;
    let mut config = config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("open", "/open", "svc")],
    );
    config.rate_limit.apply_to_all_routes = true;
    config.rate_limit.max_requests = 2;
    let gateway = TestGateway::start(config).await;

    assert_status(&gateway.get_from("/open", "203.0.113.1").await, 200);
    assert_status(&gateway.get_from("/open", "203.0.113.1").await, 200);
    assert_status(&gateway.get_from("/open", "203.0.113.1").await, 429);
}

/// Denied requests show up in the metrics
#[tokio::test]
async fn test_denials_are_counted() {
    let (_upstream, gateway) = limited_gateway(RateLimitPolicy::new(1, 60)).await;

    gateway.get_from("/search", "198.51.100.5").await;
    gateway.get_from("/search", "198.51.100.5").await;

    let metrics = gateway.get("/metrics").await.text().await.expect("body");
    assert!(metrics.contains("gateway_rate_limited_total{scope=\"ip\"} 1"));
}
