//! Metrics helpers for Portico.
//!
//! Convenience functions and RAII timers wrapping the `metrics` crate macros.
//! [`init_metrics`] installs a Prometheus recorder whose scrape endpoint listens on
//! `metrics.listen_addr`.
//!
//! Provided metrics (labels vary by family):
//! * `portico_requests_total` (counter: route, method, status)
//! * `portico_request_duration_seconds` (histogram: route, method)
//! * `portico_backend_requests_total` (counter: backend, method, status)
//! * `portico_backend_request_duration_seconds` (histogram: backend, method)
//! * `portico_circuit_breaker_state` (gauge per breaker: 0 closed, 1 half-open, 2 open)
//! * `portico_rate_limited_total` (counter: route)
//! * `portico_retry_attempts_total` (counter: route)
//! * `portico_fallbacks_total` (counter: service, reason)
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use eyre::WrapErr;
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use crate::config::models::MetricsConfig;

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub const PORTICO_REQUESTS_TOTAL: &str = "portico_requests_total";
pub const PORTICO_REQUEST_DURATION_SECONDS: &str = "portico_request_duration_seconds";
pub const PORTICO_BACKEND_REQUESTS_TOTAL: &str = "portico_backend_requests_total";
pub const PORTICO_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "portico_backend_request_duration_seconds";
pub const PORTICO_CIRCUIT_BREAKER_STATE: &str = "portico_circuit_breaker_state";
pub const PORTICO_RATE_LIMITED_TOTAL: &str = "portico_rate_limited_total";
pub const PORTICO_RETRY_ATTEMPTS_TOTAL: &str = "portico_retry_attempts_total";
pub const PORTICO_FALLBACKS_TOTAL: &str = "portico_fallbacks_total";

fn describe_metrics() {
    describe_counter!(
        PORTICO_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        PORTICO_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of backend attempts, retries included."
    );
    describe_histogram!(
        PORTICO_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of individual backend attempts."
    );
    describe_gauge!(
        PORTICO_CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        PORTICO_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by a rate limiter."
    );
    describe_counter!(
        PORTICO_RETRY_ATTEMPTS_TOTAL,
        Unit::Count,
        "Backend attempts re-issued after a retryable failure."
    );
    describe_counter!(
        PORTICO_FALLBACKS_TOTAL,
        Unit::Count,
        "Requests answered with a fallback payload."
    );
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(route: &str, method: &str, status: u16) {
    counter!(
        PORTICO_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(route: &str, method: &str, duration: Duration) {
    histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment the backend attempt counter. Transport failures use status `0`.
pub fn increment_backend_request_total(backend: &str, method: &str, status: u16) {
    counter!(
        PORTICO_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_backend_request_duration(backend: &str, method: &str, duration: Duration) {
    histogram!(
        PORTICO_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_circuit_breaker_state(breaker: &str, state: f64) {
    gauge!(PORTICO_CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(state);
}

pub fn increment_rate_limited(route: &str) {
    counter!(PORTICO_RATE_LIMITED_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn increment_retry_attempts(route: &str) {
    counter!(PORTICO_RETRY_ATTEMPTS_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn increment_fallbacks(service: &str, reason: &str) {
    counter!(
        PORTICO_FALLBACKS_TOTAL,
        "service" => service.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    route: String,
    method: String,
}

impl RequestTimer {
    pub fn new(route: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
            method: method.to_string(),
        }
    }

    /// Relabel once the route is known.
    pub fn set_route(&mut self, route: &str) {
        self.route = route.to_string();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring backend attempt duration.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.backend, &self.method, self.start.elapsed());
    }
}

/// Install the Prometheus recorder and its scrape listener, then register descriptions.
///
/// Must run inside a Tokio runtime and at most once per process.
pub fn init_metrics(config: &MetricsConfig) -> eyre::Result<()> {
    if !config.enabled {
        tracing::info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid metrics listen address '{}'", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "portico")
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)
        .wrap_err("Invalid histogram buckets")?
        .install()
        .wrap_err("Failed to install Prometheus metrics exporter")?;

    describe_metrics();
    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
