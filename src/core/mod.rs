pub mod circuit_breaker;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod instance;
pub mod load_balancer;
pub mod rate_limiter;
pub mod resolver;
pub mod retry;
pub mod route_table;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use error::GatewayError;
pub use fallback::{FallbackDispatcher, FallbackResponse};
pub use gateway::GatewayService;
pub use load_balancer::LoadBalancerFactory;
pub use rate_limiter::RequestRateLimiter;
pub use resolver::ServiceResolver;
pub use route_table::RouteTable;
