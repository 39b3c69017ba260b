//! Core gateway orchestration service.
//!
//! The `GatewayService` owns the active configuration snapshot (compiled routes, rate
//! limiters, fallbacks, resolver) behind an `ArcSwap`, the circuit breaker registry that
//! outlives reloads, and the outbound HTTP client port. Every request loads the snapshot
//! once and runs the pipeline against it:
//!
//! 1. match a route (404 when none)
//! 2. rate limit by key (429 when denied)
//! 3. circuit breaker gate (fallback when open)
//! 4. resolve a backend instance (fallback when none)
//! 5. rewrite the path, buffer the body, forward with retries
//! 6. relay the backend response and record success
//! 7. or record the failure and answer with the fallback
//!
//! Steps 4 to 7 run under the request deadline.
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::{
    Json,
    body::{Body as AxumBody, Bytes},
    response::{IntoResponse, Response},
};
use eyre::{Result, WrapErr, eyre};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header,
    request::Parts,
};
use http_body_util::{BodyExt, Limited, LengthLimitError};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use crate::{
    config::models::GatewayConfig,
    core::{
        circuit_breaker::{BreakerPermit, BreakerSnapshot, CircuitBreakerRegistry},
        error::GatewayError,
        fallback::{FallbackDispatcher, FallbackResponse},
        instance::ServiceInstance,
        rate_limiter::{Admission, RequestRateLimiter, retry_after_secs},
        resolver::ServiceResolver,
        retry::{AttemptResult, RetryExecutor},
        route_table::{CompiledRoute, RouteTable, RouteTarget},
    },
    metrics::{self, RequestTimer},
    ports::{
        http_client::{HttpClient, HttpClientError, HttpClientResult},
        service_registry::ServiceRegistry,
    },
    tracing_setup,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Immutable view of one configuration generation.
pub struct GatewaySnapshot {
    pub config: Arc<GatewayConfig>,
    pub routes: RouteTable,
    pub fallbacks: FallbackDispatcher,
    pub resolver: Arc<ServiceResolver>,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    default_limiter: Option<Arc<RequestRateLimiter>>,
    route_limiters: HashMap<String, Arc<RequestRateLimiter>>,
}

impl GatewaySnapshot {
    pub fn build(config: GatewayConfig, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        let routes = RouteTable::compile(&config.routes, &config.circuit_breakers)
            .wrap_err("Failed to compile route table")?;

        let attempt_timeout = parse_duration("timeouts.attempt", &config.timeouts.attempt)?;
        let request_timeout = parse_duration("timeouts.request", &config.timeouts.request)?;

        let default_limiter = config
            .rate_limit
            .as_ref()
            .map(RequestRateLimiter::new)
            .transpose()
            .map_err(|e| eyre!("Invalid gateway rate_limit: {e}"))?
            .map(Arc::new);

        let mut route_limiters = HashMap::new();
        for route in routes.routes() {
            if let Some(policy) = &route.rate_limit {
                let limiter = RequestRateLimiter::new(policy)
                    .map_err(|e| eyre!("Invalid rate limiter for route '{}': {e}", route.id))?;
                route_limiters.insert(route.id.clone(), Arc::new(limiter));
            }
        }

        let resolver = Arc::new(ServiceResolver::new(registry, config.load_balance));

        Ok(Self {
            fallbacks: FallbackDispatcher::new(&config.fallbacks),
            max_body_bytes: config.max_body_bytes,
            config: Arc::new(config),
            routes,
            resolver,
            attempt_timeout,
            request_timeout,
            default_limiter,
            route_limiters,
        })
    }

    /// The limiter governing a route: its own filter, else the gateway-wide policy.
    pub fn limiter_for(&self, route_id: &str) -> Option<&Arc<RequestRateLimiter>> {
        self.route_limiters
            .get(route_id)
            .or(self.default_limiter.as_ref())
    }

    fn limiters(&self) -> impl Iterator<Item = &Arc<RequestRateLimiter>> {
        self.default_limiter.iter().chain(self.route_limiters.values())
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).wrap_err_with(|| format!("Invalid {field} '{value}'"))
}

#[derive(Debug, Serialize)]
pub struct RouteStatus {
    pub id: String,
    pub path: String,
    pub target: String,
    pub circuit_breaker: Option<String>,
    pub retry_attempts: u32,
    pub rate_limited: bool,
}

/// Diagnostics served by the `/status` endpoint.
#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub registry: &'static str,
    pub routes: Vec<RouteStatus>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub rate_limiter_keys: usize,
}

/// Central orchestrator of the request pipeline.
///
/// Construct with [`GatewayService::new`]; swap configuration generations with
/// [`GatewayService::reload`]. Breaker state survives reloads unless a breaker's
/// policy changes; limiter state is rebuilt.
pub struct GatewayService {
    snapshot: ArcSwap<GatewaySnapshot>,
    breakers: CircuitBreakerRegistry,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn ServiceRegistry>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        let snapshot = GatewaySnapshot::build(config, registry)?;
        tracing::info!(
            routes = snapshot.routes.len(),
            registry = snapshot.resolver.registry().kind(),
            "Gateway service created"
        );
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            breakers: CircuitBreakerRegistry::new(),
            http_client,
        })
    }

    /// Publish a new configuration generation. In-flight requests keep the old one.
    pub async fn reload(
        &self,
        config: GatewayConfig,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<()> {
        let snapshot = GatewaySnapshot::build(config, registry)?;
        let mut referenced = HashSet::new();
        for route in snapshot.routes.routes() {
            if let Some(binding) = &route.breaker {
                self.breakers.get_or_create(&binding.name, &binding.policy).await;
                referenced.insert(binding.name.clone());
            }
        }
        let routes = snapshot.routes.len();
        self.snapshot.store(Arc::new(snapshot));

        let removed = self.breakers.retain_names(&referenced).await;
        if !removed.is_empty() {
            tracing::info!(breakers = ?removed, "Removed circuit breakers no longer referenced");
        }
        tracing::info!(routes, "Gateway configuration reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot.load_full()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn fallback_for_path(&self, path: &str) -> Option<FallbackResponse> {
        self.snapshot.load().fallbacks.for_path(path)
    }

    /// Drop fully refilled buckets from every limiter of the active snapshot.
    pub fn evict_idle_rate_limit_keys(&self) {
        let snapshot = self.snapshot.load();
        for limiter in snapshot.limiters() {
            limiter.evict_idle();
        }
    }

    pub fn tracked_rate_limit_keys(&self) -> usize {
        self.snapshot
            .load()
            .limiters()
            .map(|limiter| limiter.tracked_keys())
            .sum()
    }

    pub async fn status(&self) -> GatewayStatus {
        let snapshot = self.snapshot.load_full();
        let routes = snapshot
            .routes
            .routes()
            .iter()
            .map(|route| RouteStatus {
                id: route.id.clone(),
                path: route.pattern.clone(),
                target: match &route.target {
                    RouteTarget::Service(name) => format!("lb://{name}"),
                    RouteTarget::Url(url) => url.to_string(),
                },
                circuit_breaker: route.breaker.as_ref().map(|b| b.name.clone()),
                retry_attempts: route.retry.max_attempts,
                rate_limited: snapshot.limiter_for(&route.id).is_some(),
            })
            .collect();
        GatewayStatus {
            registry: snapshot.resolver.registry().kind(),
            routes,
            circuit_breakers: self.breakers.snapshots().await,
            rate_limiter_keys: self.tracked_rate_limit_keys(),
        }
    }

    /// Run the request pipeline. Never fails: every outcome maps to a response.
    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        let snapshot = self.snapshot.load_full();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let span = tracing_setup::create_request_span(method.as_str(), &path, &request_id);
        let start = std::time::Instant::now();
        let mut timer = RequestTimer::new("unmatched", method.as_str());

        let (route_id, response) = async {
            let Some(route) = snapshot.routes.match_path(&path) else {
                tracing::debug!(path = %path, "No route matched");
                return (None, self.error_response(&snapshot, None, GatewayError::RouteNotFound(path.clone())));
            };
            tracing::Span::current().record("route.id", route.id.as_str());

            let response = match self.run_route(&snapshot, &route, req, client_addr).await {
                Ok(response) => response,
                Err(err) => self.error_response(&snapshot, Some(route.as_ref()), err),
            };
            (Some(route.id.clone()), response)
        }
        .instrument(span.clone())
        .await;

        let status = response.status().as_u16();
        let route_label = route_id.as_deref().unwrap_or("unmatched");
        timer.set_route(route_label);
        metrics::increment_request_total(route_label, method.as_str(), status);
        span.record("http.status_code", status);
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        response
    }

    /// Steps 2-7 for a matched route.
    async fn run_route(
        &self,
        snapshot: &GatewaySnapshot,
        route: &Arc<CompiledRoute>,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response, GatewayError> {
        if let Some(limiter) = snapshot.limiter_for(&route.id) {
            let key = limiter.key_for(req.headers(), client_addr);
            if let Admission::Denied { retry_after } = limiter.admit(&key) {
                metrics::increment_rate_limited(&route.id);
                return Err(GatewayError::RateLimitExceeded { key, retry_after });
            }
        }

        let permit = match &route.breaker {
            Some(binding) => {
                let breaker = self
                    .breakers
                    .get_or_create(&binding.name, &binding.policy)
                    .await;
                Some(breaker.try_acquire()?)
            }
            None => None,
        };

        let deadline = snapshot.request_timeout;
        match tokio::time::timeout(
            deadline,
            self.forward(snapshot, route, req, client_addr, permit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::DeadlineExceeded(deadline)),
        }
    }

    /// Steps 4-7. Dropping this future drops the permit unsettled.
    async fn forward(
        &self,
        snapshot: &GatewaySnapshot,
        route: &CompiledRoute,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
        permit: Option<BreakerPermit>,
    ) -> Result<Response, GatewayError> {
        let instance = match &route.target {
            RouteTarget::Service(service) => match snapshot.resolver.resolve(service).await {
                Ok(instance) => instance,
                Err(err) => {
                    if let Some(permit) = permit {
                        permit.record_failure();
                    }
                    return Err(err.into());
                }
            },
            RouteTarget::Url(url) => ServiceInstance::from_url(url),
        };

        let (parts, body) = req.into_parts();
        let uri = backend_uri(&instance, &route.rewrite_path(parts.uri.path()), parts.uri.query())
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        let body = buffer_body(body, snapshot.max_body_bytes).await?;
        let headers = forwarded_headers(&parts, client_addr);

        let outcome = RetryExecutor::new(&route.retry, &route.id)
            .execute(&parts.method, snapshot.attempt_timeout, |attempt| {
                let client = Arc::clone(&self.http_client);
                let request = build_request(&parts.method, &uri, &headers, &body);
                tracing::debug!(attempt, instance = %instance.instance_id, %uri, "Forwarding request");
                async move { client.send_request(request?).await }
            })
            .await;

        match outcome.result {
            AttemptResult::Success(response) => {
                if let Some(permit) = permit {
                    permit.record_success();
                }
                if response.status().is_client_error() {
                    let err = GatewayError::BackendClientError(response.status());
                    tracing::debug!(route = %route.id, kind = err.kind(), "{err}");
                }
                Ok(response)
            }
            AttemptResult::ServerError(response) => match permit {
                Some(permit) => {
                    permit.record_failure();
                    Err(GatewayError::BackendErrorResponse {
                        status: response.status(),
                        attempts: outcome.attempts,
                    })
                }
                None => Ok(response),
            },
            AttemptResult::Failed(source) => {
                if let Some(permit) = permit {
                    permit.record_failure();
                }
                Err(GatewayError::BackendCallFailed {
                    attempts: outcome.attempts,
                    source,
                })
            }
        }
    }

    fn error_response(
        &self,
        snapshot: &GatewaySnapshot,
        route: Option<&CompiledRoute>,
        err: GatewayError,
    ) -> Response {
        if err.falls_back() {
            let label = match route {
                Some(route) => snapshot.fallbacks.label_for(
                    route.breaker.as_ref().and_then(|b| b.fallback_path.as_deref()),
                    &route.target.service_name(),
                ),
                None => "Gateway".to_string(),
            };
            tracing::warn!(kind = err.kind(), service = %label, error = %err, "Serving fallback");
            metrics::increment_fallbacks(&label, err.kind());
            return snapshot.fallbacks.fallback(&label).into_response();
        }

        match err {
            GatewayError::RouteNotFound(_) => json_error(StatusCode::NOT_FOUND, err.to_string()),
            GatewayError::RateLimitExceeded { ref key, retry_after } => {
                tracing::info!(key = %key, ?retry_after, "Rate limit exceeded");
                let mut response = json_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Rate limit exceeded. Please retry later.".to_string(),
                );
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs(retry_after)),
                );
                response
            }
            GatewayError::PayloadTooLarge { .. } => {
                json_error(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            _ => {
                tracing::debug!(kind = err.kind(), error = %err, "Rejecting request");
                json_error(StatusCode::BAD_REQUEST, err.to_string())
            }
        }
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    let body = json!({
        "status": status.as_u16(),
        "error": status.canonical_reason().unwrap_or_default(),
        "message": message,
    });
    (status, Json(body)).into_response()
}

fn backend_uri(instance: &ServiceInstance, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
    let uri = match query {
        Some(query) => format!("{}{path}?{query}", instance.base_url()),
        None => format!("{}{path}", instance.base_url()),
    };
    Ok(uri.parse::<Uri>()?)
}

async fn buffer_body(body: AxumBody, limit: usize) -> Result<Bytes, GatewayError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::PayloadTooLarge { limit })
        }
        Err(err) => Err(GatewayError::InvalidRequest(format!("unreadable body: {err}"))),
    }
}

fn forwarded_headers(parts: &Parts, client_addr: Option<SocketAddr>) -> HeaderMap {
    let mut headers = parts.headers.clone();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    let original_host = headers.remove(header::HOST);

    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = parts.uri.scheme_str().unwrap_or("http");
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    headers
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> HttpClientResult<Request<AxumBody>> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(AxumBody::from(body.clone()))
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers.clone();
    Ok(request)
}
