use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;
use url::Url;

/// Errors related to backend addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend base URL (scheme + authority, no trailing slash)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    host: String,
    port: u16,
    is_secure: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is a valid http(s) URL
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let parsed = Url::parse(url)
            .map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BackendError::InvalidUrl(format!("{url}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| BackendError::InvalidUrl(format!("{url}: missing port")))?;

        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
            host,
            port,
            is_secure,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Registry-reported status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    /// Parse a registry status string (`UP`, `DOWN`, `STARTING`, `OUT_OF_SERVICE`).
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "UP" => InstanceStatus::Up,
            "DOWN" => InstanceStatus::Down,
            "STARTING" => InstanceStatus::Starting,
            "OUT_OF_SERVICE" => InstanceStatus::OutOfService,
            _ => InstanceStatus::Unknown,
        }
    }
}

/// A backend instance as reported by the service registry. Read-only for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub status: InstanceStatus,
}

impl ServiceInstance {
    pub fn new(host: impl Into<String>, port: u16, secure: bool, status: InstanceStatus) -> Self {
        let host = host.into();
        Self {
            instance_id: format!("{host}:{port}"),
            host,
            port,
            secure,
            status,
        }
    }

    /// An `Up` instance for a statically configured URL.
    pub fn from_url(url: &BackendUrl) -> Self {
        Self::new(url.host(), url.port(), url.is_secure(), InstanceStatus::Up)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// Base URL used to forward requests, e.g. `http://10.0.0.5:8081`.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        if self.host.contains(':') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}
