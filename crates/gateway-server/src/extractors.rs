//! Custom Axum extractors for the gateway.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use std::convert::Infallible;
use std::net::SocketAddr;

/// Extract the request ID from headers or generate one
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-request-id")
            .or_else(|| parts.headers.get("x-correlation-id"))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

        Ok(Self(id))
    }
}

/// Extract the client address
///
/// The socket peer wins when the listener provides it; forwarding headers are
/// only consulted when it does not.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(Some(addr.ip().to_string())));
        }

        let ip = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                parts
                    .headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        Ok(Self(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_of(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).expect("valid request").into_parts().0
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let mut parts = parts_of(Request::builder().uri("/").header("x-request-id", "abc-123"));
        let RequestId(id) = RequestId::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert_eq!(id, "abc-123");
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let mut parts = parts_of(Request::builder().uri("/"));
        let RequestId(id) = RequestId::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_client_ip_prefers_peer_address() {
        let mut parts = parts_of(Request::builder().uri("/").header("x-forwarded-for", "203.0.113.7"));
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 40000))));

        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert_eq!(ip.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_client_ip_falls_back_to_headers() {
        let mut parts = parts_of(
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
        );
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert_eq!(ip.as_deref(), Some("203.0.113.7"));

        let mut parts = parts_of(Request::builder().uri("/").header("x-real-ip", "198.51.100.2"));
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert_eq!(ip.as_deref(), Some("198.51.100.2"));
    }
}
