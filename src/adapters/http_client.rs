use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tracing::Instrument;

use crate::{
    metrics::{self, BackendRequestTimer},
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup,
};

/// HTTP client adapter using Hyper with Rustls.
///
/// Forces the outgoing request version to HTTP/1.1 (ALPN may still negotiate h2 over
/// TLS), rewrites `Host` to the backend authority and streams bodies in both directions.
/// Timeouts and retries are applied by the caller.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                errors = ?native_certs.errors,
                "Some native certificates failed to load"
            );
        }
        tracing::debug!(roots = root_cert_store.len(), "Loaded native root certificates");

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!("Created backend HTTP client");
        Ok(Self { client })
    }

    fn authority_header(req: &Request<AxumBody>) -> HttpClientResult<HeaderValue> {
        let authority = req.uri().authority().ok_or_else(|| {
            HttpClientError::InvalidRequest(format!("Outgoing URI has no host: {}", req.uri()))
        })?;
        HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpClientError::InvalidRequest(format!("Invalid authority: {e}")))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let host = Self::authority_header(&req)?;
        req.headers_mut().insert(header::HOST, host);

        let backend = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let method = req.method().to_string();
        let span = tracing_setup::create_backend_span(&backend, &method, req.uri().path());

        let client = self.client.clone();
        async move {
            let _timer = BackendRequestTimer::new(&backend, &method);

            let (mut parts, body) = req.into_parts();
            parts.version = Version::HTTP_11;
            tracing::debug!(uri = %parts.uri, headers = ?parts.headers, "Sending backend request");
            let uri = parts.uri.clone();

            match client.request(Request::from_parts(parts, body)).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::Span::current().record("http.status_code", status);
                    metrics::increment_backend_request_total(&backend, &method, status);

                    let (mut parts, hyper_body) = response.into_parts();
                    // The server re-frames the relayed body.
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
                }
                Err(e) => {
                    metrics::increment_backend_request_total(&backend, &method, 0);
                    tracing::warn!(%uri, error = %e, "Backend request failed");
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::HeaderMap, routing::get};
    use http_body_util::BodyExt;

    use super::*;

    async fn spawn_backend() -> std::net::SocketAddr {
        let app = Router::new().route(
            "/echo-host",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_forwards_with_backend_host_header() {
        let addr = spawn_backend().await;
        let client = HttpClientAdapter::new().unwrap();

        let request = Request::builder()
            .uri(format!("http://{addr}/echo-host"))
            .header(header::HOST, "gateway.example.com")
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(request).await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, addr.to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new().unwrap();
        let request = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        let err = client.send_request(request).await.unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = HttpClientAdapter::new().unwrap();
        let request = Request::builder()
            .uri("/no-host")
            .body(AxumBody::empty())
            .unwrap();
        let err = client.send_request(request).await.unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }
}
