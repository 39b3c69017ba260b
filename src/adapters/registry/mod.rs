pub mod eureka;
pub mod static_registry;

use std::sync::Arc;

use eyre::{Result, WrapErr};

pub use eureka::EurekaRegistry;
pub use static_registry::StaticRegistry;

use crate::{config::models::RegistryConfig, ports::service_registry::ServiceRegistry};

/// Build the registry described by the configuration.
pub fn build_registry(config: &RegistryConfig) -> Result<Arc<dyn ServiceRegistry>> {
    match config {
        RegistryConfig::Static { services } => Ok(Arc::new(StaticRegistry::new(services)?)),
        RegistryConfig::Eureka {
            url,
            timeout,
            cache_ttl,
        } => {
            let timeout = humantime::parse_duration(timeout)
                .wrap_err_with(|| format!("Invalid registry timeout '{timeout}'"))?;
            let cache_ttl = humantime::parse_duration(cache_ttl)
                .wrap_err_with(|| format!("Invalid registry cache_ttl '{cache_ttl}'"))?;
            tracing::info!(url = %url, ?timeout, ?cache_ttl, "Using Eureka service registry");
            Ok(Arc::new(EurekaRegistry::new(url, timeout, cache_ttl)?))
        }
    }
}
