//! Logical service name → concrete backend instance.
//!
//! The resolver asks the [`ServiceRegistry`] port for the current snapshot, keeps the
//! instances reported `UP` and lets a per-service load balancing strategy pick one.
//! Each service gets its own strategy instance so round-robin counters of unrelated
//! services do not interfere.
use std::sync::Arc;

use scc::HashMap;
use thiserror::Error;

use crate::{
    config::LoadBalanceStrategy,
    core::{
        instance::ServiceInstance,
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
    },
    ports::service_registry::{RegistryError, ServiceRegistry},
};

#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("No instance available for service '{0}'")]
    NoInstanceAvailable(String),

    #[error("Registry lookup for service '{service}' failed: {source}")]
    Registry {
        service: String,
        #[source]
        source: RegistryError,
    },
}

pub struct ServiceResolver {
    registry: Arc<dyn ServiceRegistry>,
    strategy: LoadBalanceStrategy,
    balancers: HashMap<String, Arc<dyn LoadBalancingStrategy>>,
}

impl ServiceResolver {
    pub fn new(registry: Arc<dyn ServiceRegistry>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            strategy,
            balancers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    /// Resolve a healthy instance for `service`.
    pub async fn resolve(&self, service: &str) -> Result<ServiceInstance, ResolveError> {
        let snapshot = self
            .registry
            .instances(service)
            .await
            .map_err(|source| ResolveError::Registry {
                service: service.to_string(),
                source,
            })?;

        let healthy: Vec<ServiceInstance> =
            snapshot.iter().filter(|i| i.is_up()).cloned().collect();
        if healthy.is_empty() {
            tracing::warn!(
                service,
                registered = snapshot.len(),
                "No healthy instance registered"
            );
            return Err(ResolveError::NoInstanceAvailable(service.to_string()));
        }

        let balancer = self.balancer_for(service).await;
        let selected = balancer
            .select(&healthy)
            .cloned()
            .ok_or_else(|| ResolveError::NoInstanceAvailable(service.to_string()))?;

        tracing::debug!(
            service,
            instance = %selected.instance_id,
            candidates = healthy.len(),
            "Resolved service instance"
        );
        Ok(selected)
    }

    async fn balancer_for(&self, service: &str) -> Arc<dyn LoadBalancingStrategy> {
        let key = service.to_ascii_uppercase();
        if let Some(entry) = self.balancers.get_async(&key).await {
            return entry.get().clone();
        }
        self.balancers
            .entry_async(key)
            .await
            .or_insert_with(|| LoadBalancerFactory::create_strategy(&self.strategy))
            .get()
            .clone()
    }
}
