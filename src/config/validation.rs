use std::{collections::HashSet, net::SocketAddr, time::Duration};

use http::HeaderName;

use crate::{
    config::models::{
        CircuitBreakerSettings, FilterSpec, GatewayConfig, KeyResolverKind, RateLimitConfig,
        RegistryConfig, RouteDefinition,
    },
    core::route_table::{CompiledRoute, LB_SCHEME, RouteTarget},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator. Collects every problem instead of stopping at the
/// first one.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        let fallback_paths = Self::validate_fallbacks(config, &mut errors);

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for route in &config.routes {
            Self::validate_route(route, config, &fallback_paths, &mut errors);
        }
        Self::check_route_conflicts(&config.routes, &mut errors);

        Self::validate_registry(config, &mut errors);

        Self::validate_breaker_settings(
            "circuit_breakers.defaults",
            &config.circuit_breakers.defaults,
            &mut errors,
        );
        for instance in &config.circuit_breakers.instances {
            let field = format!("circuit_breakers.instances '{}'", instance.name);
            Self::validate_breaker_settings(
                &field,
                &config.circuit_breakers.settings_for(&instance.name),
                &mut errors,
            );
        }

        if let Some(rate_limit) = &config.rate_limit {
            Self::validate_rate_limit("rate_limit", rate_limit, &mut errors);
        }

        let attempt = Self::duration("timeouts.attempt", &config.timeouts.attempt, &mut errors);
        let request = Self::duration("timeouts.request", &config.timeouts.request, &mut errors);
        if let (Some(attempt), Some(request)) = (attempt, request) {
            if attempt > request {
                errors.push(ValidationError::InvalidField {
                    field: "timeouts.attempt".to_string(),
                    message: "Attempt timeout must not exceed the request timeout".to_string(),
                });
            }
        }
        Self::duration(
            "limiter_sweep_interval",
            &config.limiter_sweep_interval,
            &mut errors,
        );

        if config.metrics.enabled {
            match config.metrics.listen_addr.parse::<SocketAddr>() {
                Err(_) => errors.push(ValidationError::InvalidListenAddress {
                    address: config.metrics.listen_addr.clone(),
                    reason: "metrics.listen_addr must be in format 'IP:PORT'".to_string(),
                }),
                Ok(addr) if Some(addr) == config.listen_addr.parse::<SocketAddr>().ok() => {
                    errors.push(ValidationError::InvalidField {
                        field: "metrics.listen_addr".to_string(),
                        message: "Must differ from the gateway listen address".to_string(),
                    });
                }
                Ok(_) => {}
            }
        }

        if config.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_fallbacks<'a>(
        config: &'a GatewayConfig,
        errors: &mut Vec<ValidationError>,
    ) -> HashSet<&'a str> {
        let mut paths = HashSet::new();
        for endpoint in &config.fallbacks {
            if !endpoint.path.starts_with("/fallback/") {
                errors.push(ValidationError::InvalidField {
                    field: format!("fallbacks '{}'", endpoint.path),
                    message: "Fallback paths must start with '/fallback/'".to_string(),
                });
            }
            if endpoint.service.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("fallbacks '{}' service", endpoint.path),
                });
            }
            if !paths.insert(endpoint.path.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("fallbacks '{}'", endpoint.path),
                    message: "Fallback path declared more than once".to_string(),
                });
            }
        }
        paths
    }

    fn validate_route(
        route: &RouteDefinition,
        config: &GatewayConfig,
        fallback_paths: &HashSet<&str>,
        errors: &mut Vec<ValidationError>,
    ) {
        if route.id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' id", route.path),
            });
        }

        // Pattern, target and filter structure are checked by compiling the route.
        match CompiledRoute::compile(route, &config.circuit_breakers) {
            Ok(compiled) => {
                if let (RouteTarget::Service(service), RegistryConfig::Static { services }) =
                    (&compiled.target, &config.registry)
                {
                    if !services.iter().any(|s| s.name.eq_ignore_ascii_case(service)) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{}' uri", route.id),
                            message: format!(
                                "Service '{service}' is not declared in the static registry"
                            ),
                        });
                    }
                }
            }
            Err(e) => errors.push(ValidationError::InvalidField {
                field: format!("route '{}'", route.id),
                message: e.to_string(),
            }),
        }

        for filter in &route.filters {
            match filter {
                FilterSpec::RewritePath { replacement, .. } => {
                    if !replacement.starts_with('/') {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{}' rewrite_path.replacement", route.id),
                            message: "Path rewrite must start with '/'".to_string(),
                        });
                    }
                }
                FilterSpec::CircuitBreaker {
                    fallback_path: Some(path),
                    ..
                } => {
                    if !fallback_paths.contains(path.as_str()) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{}' circuit_breaker.fallback_path", route.id),
                            message: format!("No fallback endpoint is configured at '{path}'"),
                        });
                    }
                }
                FilterSpec::RequestRateLimiter(rate_limit) => {
                    let field = format!("route '{}' request_rate_limiter", route.id);
                    Self::validate_rate_limit(&field, rate_limit, errors);
                }
                _ => {}
            }
        }
    }

    /// Identical patterns make every route after the first unreachable.
    fn check_route_conflicts(routes: &[RouteDefinition], errors: &mut Vec<ValidationError>) {
        let mut ids = HashSet::new();
        let mut patterns: Vec<(&str, &str)> = Vec::new();
        for route in routes {
            if !ids.insert(route.id.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate route id '{}'", route.id),
                });
            }
            if let Some((first, _)) = patterns.iter().find(|(_, p)| *p == route.path) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "Route '{}' repeats the path '{}' of route '{first}' and can never match",
                        route.id, route.path
                    ),
                });
            }
            patterns.push((route.id.as_str(), route.path.as_str()));
        }
    }

    fn validate_registry(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
        match &config.registry {
            RegistryConfig::Static { services } => {
                let mut names = HashSet::new();
                for service in services {
                    let name = service.name.to_ascii_uppercase();
                    if service.name.trim().is_empty() || service.name.starts_with(LB_SCHEME) {
                        errors.push(ValidationError::InvalidField {
                            field: "registry.services".to_string(),
                            message: format!("Invalid service name '{}'", service.name),
                        });
                    }
                    if !names.insert(name) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("registry.services '{}'", service.name),
                            message: "Service declared more than once".to_string(),
                        });
                    }
                    for (i, instance) in service.instances.iter().enumerate() {
                        let context =
                            format!("registry.services '{}' instance {}", service.name, i + 1);
                        if let Err(e) = Self::validate_url(instance, &context) {
                            errors.push(e);
                        }
                    }
                }
            }
            RegistryConfig::Eureka {
                url,
                timeout,
                cache_ttl,
            } => {
                if let Err(e) = Self::validate_url(url, "registry.url") {
                    errors.push(e);
                }
                Self::duration("registry.timeout", timeout, errors);
                Self::duration("registry.cache_ttl", cache_ttl, errors);
            }
        }
    }

    fn validate_breaker_settings(
        field: &str,
        settings: &CircuitBreakerSettings,
        errors: &mut Vec<ValidationError>,
    ) {
        if settings.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.failure_threshold"),
                message: "Must be greater than 0".to_string(),
            });
        }
        Self::duration(&format!("{field}.open_duration"), &settings.open_duration, errors);
        if let Some(window) = &settings.sliding_window {
            Self::duration(&format!("{field}.sliding_window"), window, errors);
        }
    }

    fn validate_rate_limit(field: &str, config: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
        if config.replenish_rate == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.replenish_rate"),
                message: "Rate limit replenish_rate must be greater than 0".to_string(),
            });
        }
        if config.burst_capacity == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.burst_capacity"),
                message: "Rate limit burst_capacity must be greater than 0".to_string(),
            });
        }
        if config.max_tracked_keys == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.max_tracked_keys"),
                message: "Must be greater than 0".to_string(),
            });
        }
        match (config.key_resolver, &config.header_name) {
            (KeyResolverKind::UserHeader, Some(header)) => {
                if HeaderName::from_bytes(header.as_bytes()).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field}.header_name"),
                        message: format!("Invalid header name '{header}'"),
                    });
                }
            }
            (KeyResolverKind::RemoteAddr, Some(_)) => {
                tracing::warn!(field, "header_name is ignored by the remote_addr key resolver");
            }
            _ => {}
        }
    }

    fn duration(field: &str, value: &str, errors: &mut Vec<ValidationError>) -> Option<Duration> {
        match humantime::parse_duration(value) {
            Ok(duration) if duration.is_zero() => {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Duration must be greater than 0".to_string(),
                });
                None
            }
            Ok(duration) => Some(duration),
            Err(e) => {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Invalid duration '{value}': {e}"),
                });
                None
            }
        }
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }
                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
