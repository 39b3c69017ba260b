// Tests of the inbound HTTP surface through the Axum router
mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{body::Body, extract::ConnectInfo};
use common::{Reply, ScriptedClient, body_json, gateway, get};
use http::{Request, StatusCode};
use portico::{
    HttpHandler,
    adapters::router,
    config::{GatewayConfig, KeyResolverKind, RateLimitConfig, RouteDefinition},
};
use tower::ServiceExt;

fn app(config: GatewayConfig, client: Arc<ScriptedClient>) -> axum::Router {
    router(Arc::new(HttpHandler::new(Arc::new(gateway(config, client)))))
}

fn cart_config() -> GatewayConfig {
    GatewayConfig::builder()
        .static_service("CART-SERVICE", ["http://10.0.0.7:8083"])
        .rate_limit(RateLimitConfig {
            key_resolver: KeyResolverKind::RemoteAddr,
            header_name: None,
            replenish_rate: 1,
            burst_capacity: 1,
            max_tracked_keys: 100,
        })
        .route(RouteDefinition::new(
            "cart-service",
            "/api/cart/**",
            "lb://CART-SERVICE",
        ))
        .build()
        .unwrap()
}

fn from_peer(uri: &str, peer: &str) -> Request<Body> {
    let mut req = get(uri);
    let addr: SocketAddr = peer.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

#[tokio::test]
async fn test_every_response_carries_request_id() {
    let client = ScriptedClient::always(Reply::Status(200));
    let app = app(cart_config(), client);

    for uri in ["/health", "/api/cart/1", "/nowhere", "/fallback/cart"] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert!(
            response.headers().contains_key("x-request-id"),
            "missing X-Request-ID for {uri}"
        );
    }
}

#[tokio::test]
async fn test_remote_addr_limiter_uses_peer_address() {
    let client = ScriptedClient::always(Reply::Status(200));
    let app = app(cart_config(), client.clone());

    let first = app
        .clone()
        .oneshot(from_peer("/api/cart", "192.0.2.10:50000"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // Same IP, different port: same bucket
    let second = app
        .clone()
        .oneshot(from_peer("/api/cart", "192.0.2.10:50001"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = app
        .oneshot(from_peer("/api/cart", "192.0.2.11:50000"))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn test_status_lists_breakers_and_routes() {
    let client = ScriptedClient::always(Reply::Status(200));
    let app = app(cart_config(), client);

    app.clone()
        .oneshot(from_peer("/api/cart", "192.0.2.10:50000"))
        .await
        .unwrap();

    let response = app.oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["gateway"]["routes"][0]["target"], "lb://CART-SERVICE");
    assert_eq!(body["gateway"]["routes"][0]["rate_limited"], true);
    assert_eq!(body["gateway"]["rate_limiter_keys"], 1);
}
