//! Upstream failure mapping

use crate::fixtures::*;
use crate::helpers::*;
use pretty_assertions::assert_eq;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let dead = closed_port_url().await;
    let mut config = test_config();
    config.routes = vec![get_route("dead", "/dead", &dead)];
    let gateway = TestGateway::start(config).await;

    let response = gateway.get("/dead").await;
    assert_status(&response, 502);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"], "Bad Gateway");
}

#[tokio::test]
async fn test_slow_backend_is_504() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&upstream)
        .await;

    let route = get_route("slow", "/slow", "svc").with_timeout(Duration::from_millis(50));
    let gateway = TestGateway::start(config_with(backend_for("svc", &[&upstream]), vec![route])).await;

    let response = gateway.get("/slow").await;
    assert_status(&response, 504);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"], "Gateway Timeout");
}

/// Backend statuses and bodies are relayed unchanged
#[tokio::test]
async fn test_backend_errors_pass_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teapot"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("x-upstream", "kettle")
                .set_body_string("short and stout"),
        )
        .mount(&upstream)
        .await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("teapot", "/teapot", "svc")],
    ))
    .await;

    let response = gateway.get("/teapot").await;
    assert_status(&response, 418);
    assert_eq!(header(&response, "x-upstream"), Some("kettle"));
    assert_eq!(response.text().await.expect("body"), "short and stout");
}

/// Every request is counted against the matched route template
#[tokio::test]
async fn test_requests_are_counted_per_route() {
    let upstream = backend(200, "ok").await;
    let gateway = TestGateway::start(config_with(
        backend_for("svc", &[&upstream]),
        vec![get_route("users", "/users", "svc")],
    ))
    .await;

    gateway.get("/users").await;
    gateway.get("/missing").await;

    let metrics = gateway.get("/metrics").await.text().await.expect("body");
    assert!(metrics.contains(r#"gateway_requests_total{method="GET",path="/users",status="200"} 1"#));
    assert!(metrics.contains(r#"gateway_requests_total{method="GET",path="unmatched",status="404"} 1"#));
}
