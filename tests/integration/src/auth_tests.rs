//! Authentication integration tests

use crate::fixtures::*;
use crate::helpers::*;
use gateway_config::ApiKeySettings;
use gateway_core::{Identity, IdentitySource};
use pretty_assertions::assert_eq;
use secrecy::Secret;

async fn protected_gateway() -> (wiremock::MockServer, TestGateway) {
    let upstream = backend(200, "secret data").await;
    let mut config = config_with(
        backend_for("svc", &[&upstream]),
        vec![
            get_route("reports", "/reports", "svc").with_auth(true),
            get_route("admin", "/admin", "svc").with_roles(vec!["admin".into()]),
            get_route("public", "/public", "svc"),
        ],
    );
    config.api_keys.push(ApiKeySettings {
        key: Secret::new("gw_live_abc".to_string()),
        owner: "svc-reporting".into(),
        scopes: vec![],
        active: true,
        expires_at: None,
    });
    config.api_keys.push(ApiKeySettings {
        key: Secret::new("gw_disabled".to_string()),
        owner: "svc-old".into(),
        scopes: vec![],
        active: false,
        expires_at: None,
    });
    let gateway = TestGateway::start(config).await;
    (upstream, gateway)
}

#[tokio::test]
async fn test_protected_route_requires_credentials() {
    let (_upstream, gateway) = protected_gateway().await;

    let response = gateway.get("/reports").await;
    assert_status(&response, 401);
    assert_eq!(header(&response, "www-authenticate"), Some("Bearer"));
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"], "Unauthorized");
}

#[tokio::test]
async fn test_each_credential_location_is_accepted() {
    let (_upstream, gateway) = protected_gateway().await;
    let token = gateway
        .state
        .authenticator
        .issue(&Identity::new("user-42", IdentitySource::Token))
        .expect("token");

    let bearer = format!("Bearer {token}");
    let cookie = format!("token={token}");
    let cases: Vec<(&str, Vec<(&str, &str)>)> = vec![
        ("/reports", vec![("authorization", bearer.as_str())]),
        ("/reports", vec![("x-api-key", "gw_live_abc")]),
        ("/reports", vec![("cookie", cookie.as_str())]),
    ];
    for (path, headers) in cases {
        let response = gateway.get_with_headers(path, &headers).await;
        assert_status(&response, 200);
    }

    let response = gateway.get(&format!("/reports?token={token}")).await;
    assert_status(&response, 200);
}

#[tokio::test]
async fn test_invalid_and_disabled_credentials_are_rejected() {
    let (_upstream, gateway) = protected_gateway().await;

    let response = gateway
        .get_with_headers("/reports", &[("authorization", "Bearer a.b.c")])
        .await;
    assert_status(&response, 401);

    let response = gateway
        .get_with_headers("/reports", &[("x-api-key", "gw_disabled")])
        .await;
    assert_status(&response, 401);
}

#[tokio::test]
async fn test_role_requirements() {
    let (_upstream, gateway) = protected_gateway().await;
    let auth = &gateway.state.authenticator;

    let user = auth
        .issue(&Identity::new("user-1", IdentitySource::Token).with_roles(vec!["user".into()]))
        .expect("token");
    let admin = auth
        .issue(&Identity::new("user-2", IdentitySource::Token).with_roles(vec!["admin".into()]))
        .expect("token");

    let response = gateway
        .get_with_headers("/admin", &[("authorization", format!("Bearer {user}").as_str())])
        .await;
    assert_status(&response, 403);
    assert_eq!(TestGateway::json_body(response).await["error"], "Forbidden");

    let response = gateway
        .get_with_headers("/admin", &[("authorization", format!("Bearer {admin}").as_str())])
        .await;
    assert_status(&response, 200);

    // api keys carry only the "api" role
    let response = gateway
        .get_with_headers("/admin", &[("x-api-key", "gw_live_abc")])
        .await;
    assert_status(&response, 403);
}

#[tokio::test]
async fn test_public_route_tolerates_bad_credentials() {
    let (_upstream, gateway) = protected_gateway().await;

    let response = gateway
        .get_with_headers("/public", &[("x-api-key", "not-a-real-key")])
        .await;
    assert_status(&response, 200);
    assert_eq!(response.text().await.expect("body"), "secret data");
}

#[tokio::test]
async fn test_refreshed_token_is_accepted() {
    let (_upstream, gateway) = protected_gateway().await;
    let auth = &gateway.state.authenticator;

    let refresh = auth
        .issue_refresh(&Identity::new("user-7", IdentitySource::Token))
        .expect("refresh token");
    let access = auth.refresh(&refresh).expect("refresh should succeed");

    let response = gateway
        .get_with_headers("/reports", &[("authorization", format!("Bearer {access}").as_str())])
        .await;
    assert_status(&response, 200);
}
