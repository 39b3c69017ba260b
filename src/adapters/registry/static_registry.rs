use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use eyre::{Result, WrapErr};

use crate::{
    config::models::StaticServiceConfig,
    core::instance::{BackendUrl, ServiceInstance},
    ports::service_registry::{RegistryResult, ServiceRegistry},
};

/// Registry backed by instances listed in the configuration. Every instance is `Up`.
pub struct StaticRegistry {
    services: HashMap<String, Arc<[ServiceInstance]>>,
}

impl StaticRegistry {
    pub fn new(services: &[StaticServiceConfig]) -> Result<Self> {
        let mut map = HashMap::with_capacity(services.len());
        for service in services {
            let instances = service
                .instances
                .iter()
                .map(|url| {
                    BackendUrl::new(url)
                        .map(|url| ServiceInstance::from_url(&url))
                        .wrap_err_with(|| format!("Invalid instance for service '{}'", service.name))
                })
                .collect::<Result<Vec<_>>>()?;
            map.insert(service.name.to_ascii_uppercase(), Arc::from(instances));
        }
        Ok(Self { services: map })
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn instances(&self, service: &str) -> RegistryResult<Arc<[ServiceInstance]>> {
        Ok(self
            .services
            .get(&service.to_ascii_uppercase())
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new())))
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}
