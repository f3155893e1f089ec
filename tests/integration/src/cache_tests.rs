//! Response caching integration tests

use crate::fixtures::*;
use crate::helpers::*;
use gateway_core::CachePolicy;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn catalog_backend(expected_calls: u64) -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_string("catalog v1"))
        .expect(expected_calls)
        .mount(&upstream)
        .await;
    upstream
}

async fn cached_gateway(upstream: &MockServer, policy: CachePolicy) -> TestGateway {
    TestGateway::start(config_with(
        backend_for("svc", &[upstream]),
        vec![get_route("catalog", "/catalog", "svc").with_cache(policy)],
    ))
    .await
}

/// The second identical request is served without touching the backend
#[tokio::test]
async fn test_hit_after_miss() {
    let upstream = catalog_backend(1).await;
    let gateway = cached_gateway(&upstream, CachePolicy::new(60)).await;

    let first = gateway.get("/catalog").await;
    assert_status(&first, 200);
    assert_eq!(header(&first, "x-cache"), Some("MISS"));
    let first_body = first.text().await.expect("body");

    let second = gateway.get("/catalog").await;
    assert_status(&second, 200);
    assert_eq!(header(&second, "x-cache"), Some("HIT"));
    assert_eq!(second.text().await.expect("body"), first_body);

    upstream.verify().await;
}

/// Query strings are part of the cache key
#[tokio::test]
async fn test_query_string_varies_key() {
    let upstream = catalog_backend(2).await;
    let gateway = cached_gateway(&upstream, CachePolicy::new(60)).await;

    assert_eq!(header(&gateway.get("/catalog?page=1").await, "x-cache"), Some("MISS"));
    assert_eq!(header(&gateway.get("/catalog?page=2").await, "x-cache"), Some("MISS"));
    assert_eq!(header(&gateway.get("/catalog?page=1").await, "x-cache"), Some("HIT"));

    upstream.verify().await;
}

/// Different credentials never share an entry
#[tokio::test]
async fn test_authorization_varies_key() {
    let upstream = catalog_backend(2).await;
    let gateway = cached_gateway(&upstream, CachePolicy::new(60)).await;

    let alice = gateway
        .get_with_headers("/catalog", &[("authorization", "Bearer alice")])
        .await;
    assert_eq!(header(&alice, "x-cache"), Some("MISS"));
    let bob = gateway
        .get_with_headers("/catalog", &[("authorization", "Bearer bob")])
        .await;
    assert_eq!(header(&bob, "x-cache"), Some("MISS"));

    upstream.verify().await;
}

/// Only successful responses are stored
#[tokio::test]
async fn test_errors_are_not_cached() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .expect(2)
        .mount(&upstream)
        .await;
    let gateway = cached_gateway(&upstream, CachePolicy::new(60)).await;

    assert_status(&gateway.get("/catalog").await, 404);
    let again = gateway.get("/catalog").await;
    assert_status(&again, 404);
    assert_ne!(header(&again, "x-cache"), Some("HIT"));

    upstream.verify().await;
}

/// Tag invalidation forces the next request back to the backend
#[tokio::test]
async fn test_tag_invalidation() {
    let upstream = catalog_backend(2).await;
    let gateway =
        cached_gateway(&upstream, CachePolicy::new(60).with_tags(vec!["catalog".into()])).await;

    gateway.get("/catalog").await;
    assert_eq!(header(&gateway.get("/catalog").await, "x-cache"), Some("HIT"));

    let removed = gateway.state.cache.invalidate_by_tag("catalog").await;
    assert_eq!(removed, 1);

    assert_eq!(header(&gateway.get("/catalog").await, "x-cache"), Some("MISS"));
    upstream.verify().await;
}

/// Lookups are counted by result
#[tokio::test]
async fn test_cache_metrics() {
    let upstream = catalog_backend(1).await;
    let gateway = cached_gateway(&upstream, CachePolicy::new(60)).await;

    gateway.get("/catalog").await;
    gateway.get("/catalog").await;
    gateway.get("/catalog").await;

    let metrics = gateway.get("/metrics").await.text().await.expect("body");
    assert!(metrics.contains("gateway_cache_requests_total{result=\"miss\"} 1"));
    assert!(metrics.contains("gateway_cache_requests_total{result=\"hit\"} 2"));
}
