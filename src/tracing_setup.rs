use clap::ValueEnum;
use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON tracing subscriber")?;

    tracing::info!("Portico structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console tracing subscriber")?;

    tracing::info!("Portico console logging initialized");
    Ok(())
}

pub fn init(format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Json => init_tracing(),
        LogFormat::Pretty => init_console_tracing(),
    }
}

/// Shutdown tracing gracefully
pub fn shutdown_tracing() {
    // tracing-subscriber has no explicit shutdown; the fmt layer writes synchronously.
    tracing::info!("Portico tracing shutdown complete");
}

/// Create a request-scoped tracing span. `route.id` and the status are recorded later.
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        route.id = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a backend request span
pub fn create_backend_span(backend_url: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend.url = backend_url,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/api/products", "req-123");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
            assert!(metadata.fields().field("route.id").is_some());
        }
    }

    #[test]
    fn test_create_backend_span() {
        let span = create_backend_span("http://backend", "POST", "/data");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "backend_request");
        }
    }
}
