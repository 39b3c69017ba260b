use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::any,
};
use eyre::{Result, WrapErr};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::middleware::{request_id_middleware, request_timing_middleware},
    core::{GatewayService, fallback::FALLBACK_PREFIX},
};

/// HTTP entry point for Portico.
///
/// Serves the gateway's own endpoints (`/health`, `/status`, the fallback endpoints) and
/// hands everything else to the request pipeline.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let path = req.uri().path().to_string();

        match path.as_str() {
            "/health" => self.handle_health_check(),
            "/status" => self.handle_status().await,
            _ if path.starts_with(FALLBACK_PREFIX) => self.handle_fallback(&path),
            _ => Ok(self.gateway.handle(req, client_addr).await),
        }
    }

    fn handle_health_check(&self) -> Result<Response<AxumBody>, eyre::Error> {
        json_response(StatusCode::OK, &json!({ "status": "UP" }))
    }

    async fn handle_status(&self) -> Result<Response<AxumBody>, eyre::Error> {
        let status = self.gateway.status().await;
        let body = json!({
            "service": "portico",
            "version": env!("CARGO_PKG_VERSION"),
            "gateway": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, &body)
    }

    /// Direct calls to a fallback endpoint answer exactly like a fallback taken by a route.
    fn handle_fallback(&self, path: &str) -> Result<Response<AxumBody>, eyre::Error> {
        match self.gateway.fallback_for_path(path) {
            Some(fallback) => Ok(fallback.into_response()),
            None => json_response(
                StatusCode::NOT_FOUND,
                &json!({
                    "status": 404,
                    "error": "Not Found",
                    "message": format!("No fallback registered for {path}"),
                }),
            ),
        }
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Result<Response<AxumBody>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(AxumBody::from(body.to_string()))
        .wrap_err("Failed to build JSON response")
}

/// Build the Axum router serving every path through `handler`.
///
/// The server must be started with `into_make_service_with_connect_info::<SocketAddr>()`
/// for remote-address rate limiting and `X-Forwarded-For` to see the peer address.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    let make_request_route = |handler: Arc<HttpHandler>| {
        any(move |req: Request| {
            let handler = handler.clone();
            async move {
                let client_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                match handler.handle_request(req, client_addr).await {
                    Ok(response) => Ok::<Response<AxumBody>, Infallible>(response),
                    Err(e) => {
                        tracing::error!(error = ?e, "Request handling error");
                        let mut response = Response::new(AxumBody::from("Internal Server Error"));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(response)
                    }
                }
            }
        })
    };

    Router::new()
        .route("/", make_request_route(handler.clone()))
        .route("/{*path}", make_request_route(handler))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}
