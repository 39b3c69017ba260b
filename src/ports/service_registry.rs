use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::instance::ServiceInstance;

/// Errors surfaced by a service registry client
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RegistryError {
    /// The registry could not be reached or answered with an unexpected status
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// The registry answered with a payload that could not be understood
    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// ServiceRegistry defines the port (interface) to the external discovery service.
///
/// Implementations own instance health; the gateway only reads snapshots.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Return the current instance snapshot for a logical service name.
    ///
    /// An unknown service is an empty snapshot, not an error.
    async fn instances(&self, service: &str) -> RegistryResult<Arc<[ServiceInstance]>>;

    /// Short adapter name used in logs
    fn kind(&self) -> &'static str;
}
