//! Configuration data structures for Portico.
//!
//! These types map directly to YAML (also TOML / JSON) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! Routes are an ordered list: declaration order is the matching precedence.
//!
//! Keyed collections (services, breaker overrides, fallback endpoints) are expressed as
//! lists of named entries rather than maps so that names keep their original case.
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_limiter_sweep_interval() -> String {
    "60s".to_string()
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Ordered route definitions; the first matching route wins.
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakersConfig,
    /// Gateway-wide rate limit policy, overridable per route.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "default_fallbacks")]
    pub fallbacks: Vec<FallbackEndpoint>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// How often idle rate limiter keys are evicted (humantime, e.g. "60s").
    #[serde(default = "default_limiter_sweep_interval")]
    pub limiter_sweep_interval: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Look up the display label of a fallback endpoint by path.
    pub fn fallback_service(&self, path: &str) -> Option<&str> {
        self.fallbacks
            .iter()
            .find(|endpoint| endpoint.path == path)
            .map(|endpoint| endpoint.service.as_str())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            routes: Vec::new(),
            registry: RegistryConfig::default(),
            load_balance: LoadBalanceStrategy::default(),
            circuit_breakers: CircuitBreakersConfig::default(),
            rate_limit: None,
            fallbacks: default_fallbacks(),
            timeouts: TimeoutConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            limiter_sweep_interval: default_limiter_sweep_interval(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Append a route; routes are matched in the order they are added
    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Register a static service with the given instance URLs
    pub fn static_service<I, S>(mut self, name: impl Into<String>, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = StaticServiceConfig {
            name: name.into(),
            instances: instances.into_iter().map(Into::into).collect(),
        };
        match &mut self.config.registry {
            RegistryConfig::Static { services } => services.push(service),
            registry => {
                *registry = RegistryConfig::Static {
                    services: vec![service],
                }
            }
        }
        self
    }

    /// Use a registry configuration
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.config.registry = registry;
        self
    }

    /// Set the default circuit breaker settings
    pub fn circuit_breaker_defaults(mut self, settings: CircuitBreakerSettings) -> Self {
        self.config.circuit_breakers.defaults = settings;
        self
    }

    /// Override the settings for a named circuit breaker
    pub fn circuit_breaker_override(mut self, breaker: CircuitBreakerOverride) -> Self {
        self.config.circuit_breakers.instances.push(breaker);
        self
    }

    /// Set the gateway-wide rate limit policy
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Set request timeouts
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Set the maximum buffered request body size
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.max_body_bytes = bytes;
        self
    }

    /// Configure the Prometheus exporter
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.config.metrics = metrics;
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.config.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }
        Ok(self.config)
    }
}

/// A single route: path predicate, target and ordered filter chain.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteDefinition {
    pub id: String,
    /// `/prefix/**`, `/prefix/*`, an exact path, or `regex:<expr>`.
    pub path: String,
    /// `lb://SERVICE-NAME` for a discovered service or a literal `http(s)://` URL.
    pub uri: String,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, path: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            uri: uri.into(),
            filters: Vec::new(),
        }
    }

    /// Append a filter to the chain
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Filter specifications (tagged enum) interpreted by the request pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    RewritePath {
        pattern: String,
        replacement: String,
    },
    CircuitBreaker {
        name: String,
        #[serde(default)]
        fallback_path: Option<String>,
    },
    Retry(RetryConfig),
    RequestRateLimiter(RateLimitConfig),
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

/// Retry filter settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            methods: default_retry_methods(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff between retry attempts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub first: String,
    pub max: String,
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first: "50ms".to_string(),
            max: "500ms".to_string(),
            factor: 2,
        }
    }
}

/// Service registry used to resolve `lb://` targets.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RegistryConfig {
    Static {
        #[serde(default)]
        services: Vec<StaticServiceConfig>,
    },
    Eureka {
        /// Base URL of the Eureka REST API, e.g. `http://localhost:8761/eureka`.
        url: String,
        #[serde(default = "default_registry_timeout")]
        timeout: String,
        #[serde(default = "default_registry_cache_ttl")]
        cache_ttl: String,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig::Static {
            services: Vec::new(),
        }
    }
}

fn default_registry_timeout() -> String {
    "2s".to_string()
}

fn default_registry_cache_ttl() -> String {
    "5s".to_string()
}

/// Statically declared service instances.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StaticServiceConfig {
    pub name: String,
    pub instances: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
}

/// Circuit breaker defaults plus per-name overrides.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CircuitBreakersConfig {
    #[serde(default)]
    pub defaults: CircuitBreakerSettings,
    #[serde(default)]
    pub instances: Vec<CircuitBreakerOverride>,
}

impl CircuitBreakersConfig {
    /// Effective settings for a breaker name (override fields win over defaults).
    pub fn settings_for(&self, name: &str) -> CircuitBreakerSettings {
        let mut settings = self.defaults.clone();
        if let Some(instance) = self.instances.iter().find(|i| i.name == name) {
            if let Some(threshold) = instance.failure_threshold {
                settings.failure_threshold = threshold;
            }
            if instance.sliding_window.is_some() {
                settings.sliding_window = instance.sliding_window.clone();
            }
            if let Some(open_duration) = &instance.open_duration {
                settings.open_duration = open_duration.clone();
            }
        }
        settings
    }
}

/// Failure threshold and cool-down of a circuit breaker.
///
/// Without `sliding_window` failures are counted consecutively and any success resets
/// the count. With `sliding_window` (humantime, e.g. "10s") only failures inside the
/// window count towards the threshold.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub sliding_window: Option<String>,
    pub open_duration: String,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            sliding_window: None,
            open_duration: "30s".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CircuitBreakerOverride {
    pub name: String,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub sliding_window: Option<String>,
    #[serde(default)]
    pub open_duration: Option<String>,
}

/// How the rate limit key is derived from a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyResolverKind {
    /// Caller identity header, `anonymous` when absent.
    UserHeader,
    /// Caller network address, `unknown` when unavailable.
    RemoteAddr,
}

fn default_key_resolver() -> KeyResolverKind {
    KeyResolverKind::UserHeader
}

fn default_max_tracked_keys() -> usize {
    100_000
}

/// Token bucket rate limit policy.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_key_resolver")]
    pub key_resolver: KeyResolverKind,
    /// Identity header for `user_header`; defaults to `X-User-Id`.
    #[serde(default)]
    pub header_name: Option<String>,
    /// Tokens added per second.
    pub replenish_rate: u32,
    /// Bucket capacity.
    pub burst_capacity: u32,
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

/// Per-attempt and whole-request deadlines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub attempt: String,
    pub request: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt: "5s".to_string(),
            request: "30s".to_string(),
        }
    }
}

/// Prometheus exporter served on its own listener.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A fixed fallback endpoint and the service label it reports.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FallbackEndpoint {
    pub path: String,
    pub service: String,
}

impl FallbackEndpoint {
    pub fn new(path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
        }
    }
}

fn default_fallbacks() -> Vec<FallbackEndpoint> {
    vec![
        FallbackEndpoint::new("/fallback/products", "Product Service"),
        FallbackEndpoint::new("/fallback/orders", "Order Service"),
        FallbackEndpoint::new("/fallback/cart", "Cart Service"),
        FallbackEndpoint::new("/fallback/payments", "Payment Service"),
    ]
}
