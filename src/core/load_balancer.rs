use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::core::instance::ServiceInstance;

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select an instance from a snapshot of healthy instances
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;
    /// Wrap this strategy into a shared trait object
    fn shared(self) -> Arc<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        instances.get(count % instances.len())
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..instances.len());
        instances.get(index)
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(
        strategy: &crate::config::LoadBalanceStrategy,
    ) -> Arc<dyn LoadBalancingStrategy> {
        match strategy {
            crate::config::LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().shared(),
            crate::config::LoadBalanceStrategy::Random => RandomStrategy.shared(),
        }
    }
}
