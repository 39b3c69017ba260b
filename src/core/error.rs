use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::{
    core::{circuit_breaker::CircuitOpenError, resolver::ResolveError},
    ports::http_client::HttpClientError,
};

/// Outcome taxonomy of the request pipeline.
///
/// None of these are fatal: each maps to a client response (a relayed backend response,
/// a status code, or a fallback payload).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("No route matches path '{0}'")]
    RouteNotFound(String),

    #[error("Rate limit exceeded for key '{key}', retry after {retry_after:?}")]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    NoInstanceAvailable(#[from] ResolveError),

    #[error("Backend call failed after {attempts} attempt(s): {source}")]
    BackendCallFailed {
        attempts: u32,
        #[source]
        source: HttpClientError,
    },

    #[error("Backend answered {status} after {attempts} attempt(s)")]
    BackendErrorResponse { status: StatusCode, attempts: u32 },

    #[error("Backend answered client error {0}")]
    BackendClientError(StatusCode),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl GatewayError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "route_not_found",
            GatewayError::RateLimitExceeded { .. } => "rate_limited",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::NoInstanceAvailable(_) => "no_instance",
            GatewayError::BackendCallFailed { .. } => "backend_call_failed",
            GatewayError::BackendErrorResponse { .. } => "backend_error_response",
            GatewayError::BackendClientError(_) => "backend_client_error",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }

    /// Whether the client is answered with a fallback payload.
    pub fn falls_back(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen(_)
                | GatewayError::NoInstanceAvailable(_)
                | GatewayError::BackendCallFailed { .. }
                | GatewayError::BackendErrorResponse { .. }
                | GatewayError::DeadlineExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitState;

    #[test]
    fn test_fallback_classification() {
        let open = GatewayError::from(CircuitOpenError {
            name: "cb".to_string(),
            state: CircuitState::Open,
        });
        assert!(open.falls_back());
        assert_eq!(open.kind(), "circuit_open");

        assert!(!GatewayError::RouteNotFound("/x".to_string()).falls_back());
        assert!(!GatewayError::BackendClientError(StatusCode::NOT_FOUND).falls_back());
        assert!(GatewayError::DeadlineExceeded(Duration::from_secs(1)).falls_back());
    }
}
