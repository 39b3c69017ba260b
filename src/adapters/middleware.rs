//! Axum middleware attached to the gateway router.
//!
//! Both layers are stateless. The request ID layer runs outermost so the ID it assigns
//! is visible to the pipeline, forwarded to backends, and echoed to the client.
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::core::gateway::REQUEST_ID_HEADER;

/// Longest caller-supplied request ID that is reused as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    tracing::debug!(%method, %uri, ?version, "Started processing request");

    let response = next.run(req).await;

    tracing::info!(
        %method,
        %uri,
        ?version,
        status = response.status().as_u16(),
        elapsed = ?start.elapsed(),
        "Completed request"
    );

    response
}

/// Keep the caller's `X-Request-ID` when it is usable, otherwise generate a UUID.
/// The ID is set on the request before it reaches the pipeline and on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let request_id = req
        .headers()
        .get(&header_name)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN && v.to_str().is_ok())
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());

    let Some(request_id) = request_id else {
        return next.run(req).await;
    };

    req.headers_mut()
        .insert(header_name.clone(), request_id.clone());
    let mut response = next.run(req).await;
    response.headers_mut().insert(header_name, request_id);

    response
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{HeaderMap, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt; // for oneshot

    use super::*;

    fn echo_app() -> Router {
        Router::new()
            .route(
                "/",
                get(|headers: HeaderMap| async move {
                    let seen = headers
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    (StatusCode::OK, seen)
                }),
            )
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let response = echo_app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let request_id = response
            .headers()
            .get("X-Request-ID")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&request_id).is_ok());

        // The handler saw the same ID
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, request_id.as_bytes());
    }

    #[tokio::test]
    async fn test_incoming_request_id_is_reused() {
        let response = echo_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-ID", "trace-abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get("X-Request-ID").unwrap(), "trace-abc-123");
    }

    #[tokio::test]
    async fn test_oversized_request_id_is_replaced() {
        let response = echo_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-ID", "x".repeat(MAX_REQUEST_ID_LEN + 1))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let request_id = response.headers().get("X-Request-ID").unwrap().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn test_request_timing_middleware_passes_through() {
        let app = Router::new()
            .route("/", get(|| async { StatusCode::ACCEPTED }))
            .layer(middleware::from_fn(request_timing_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
