//! Canned degraded responses for unavailable services.
use std::collections::HashMap;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Serialize;

use crate::config::models::FallbackEndpoint;

pub const FALLBACK_PREFIX: &str = "/fallback/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackResponse {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub error: String,
    pub message: String,
    pub service: String,
}

impl FallbackResponse {
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            timestamp: Utc::now(),
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            error: "Service Unavailable".to_string(),
            message: format!("{service} is temporarily unavailable. Please try again later."),
            service,
        }
    }
}

impl IntoResponse for FallbackResponse {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, Json(self)).into_response()
    }
}

/// Maps fallback endpoint paths to the service label they report.
#[derive(Debug, Clone, Default)]
pub struct FallbackDispatcher {
    endpoints: HashMap<String, String>,
}

impl FallbackDispatcher {
    pub fn new(endpoints: &[FallbackEndpoint]) -> Self {
        Self {
            endpoints: endpoints
                .iter()
                .map(|e| (e.path.clone(), e.service.clone()))
                .collect(),
        }
    }

    pub fn fallback(&self, service: &str) -> FallbackResponse {
        FallbackResponse::new(service)
    }

    /// Response of a configured fallback endpoint, `None` for unknown paths.
    pub fn for_path(&self, path: &str) -> Option<FallbackResponse> {
        self.endpoints.get(path).map(FallbackResponse::new)
    }

    /// Service label for a breaker's fallback path, else `default`.
    pub fn label_for(&self, fallback_path: Option<&str>, default: &str) -> String {
        fallback_path
            .and_then(|path| self.endpoints.get(path))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}
