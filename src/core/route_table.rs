//! Compiled, ordered route table.
//!
//! Route definitions are compiled once per configuration snapshot: path patterns into
//! predicates, rewrite expressions into regexes, filter specs into typed policies.
//! Matching is a pure function over the compiled table; the first route in declaration
//! order whose predicate accepts the path wins.
use std::{collections::HashSet, sync::Arc};

use regex::Regex;
use thiserror::Error;

use crate::{
    config::models::{CircuitBreakersConfig, FilterSpec, RateLimitConfig, RouteDefinition},
    core::{
        circuit_breaker::BreakerPolicy,
        instance::BackendUrl,
        retry::RetryPolicy,
    },
};

pub const LB_SCHEME: &str = "lb://";
const REGEX_PREFIX: &str = "regex:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route '{route}': duplicate route id")]
    DuplicateId { route: String },

    #[error("Route '{route}': invalid path pattern '{pattern}': {reason}")]
    InvalidPattern {
        route: String,
        pattern: String,
        reason: String,
    },

    #[error("Route '{route}': invalid target '{uri}': {reason}")]
    InvalidTarget {
        route: String,
        uri: String,
        reason: String,
    },

    #[error("Route '{route}': invalid rewrite pattern '{pattern}': {reason}")]
    InvalidRewrite {
        route: String,
        pattern: String,
        reason: String,
    },

    #[error("Route '{route}': filter '{filter}' declared more than once")]
    DuplicateFilter { route: String, filter: &'static str },

    #[error("Route '{route}': invalid {filter} filter: {reason}")]
    InvalidFilter {
        route: String,
        filter: &'static str,
        reason: String,
    },
}

/// Where a matched request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Logical service resolved through the registry (`lb://NAME`).
    Service(String),
    /// Literal backend URL.
    Url(BackendUrl),
}

impl RouteTarget {
    pub fn parse(uri: &str) -> Result<Self, String> {
        if let Some(name) = uri.strip_prefix(LB_SCHEME) {
            let name = name.trim_end_matches('/');
            if name.is_empty() || name.contains('/') {
                return Err("service name must be a single non-empty segment".to_string());
            }
            return Ok(RouteTarget::Service(name.to_string()));
        }
        BackendUrl::new(uri)
            .map(RouteTarget::Url)
            .map_err(|e| e.to_string())
    }

    /// Logical service name, or the backend authority for literal targets.
    pub fn service_name(&self) -> String {
        match self {
            RouteTarget::Service(name) => name.clone(),
            RouteTarget::Url(url) => format!("{}:{}", url.host(), url.port()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PathPredicate {
    Exact(String),
    /// `/base/**`; an empty base matches every path.
    Prefix(String),
    /// `/base/*`: exactly one segment below the base.
    Segment(String),
    Pattern(Regex),
}

impl PathPredicate {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        if let Some(expr) = pattern.strip_prefix(REGEX_PREFIX) {
            let regex = Regex::new(&format!("^(?:{expr})$")).map_err(|e| e.to_string())?;
            return Ok(PathPredicate::Pattern(regex));
        }
        if !pattern.starts_with('/') {
            return Err("pattern must start with '/' or 'regex:'".to_string());
        }
        if let Some(base) = pattern.strip_suffix("/**") {
            return Self::check_literal(base).map(|_| PathPredicate::Prefix(base.to_string()));
        }
        if let Some(base) = pattern.strip_suffix("/*") {
            return Self::check_literal(base).map(|_| PathPredicate::Segment(base.to_string()));
        }
        Self::check_literal(pattern).map(|_| PathPredicate::Exact(pattern.to_string()))
    }

    fn check_literal(part: &str) -> Result<(), String> {
        if part.contains('*') {
            return Err("wildcards are only supported as a trailing '/*' or '/**'".to_string());
        }
        Ok(())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPredicate::Exact(exact) => path == exact,
            PathPredicate::Prefix(base) => {
                base.is_empty()
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            }
            PathPredicate::Segment(base) => path
                .strip_prefix(base.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|segment| !segment.is_empty() && !segment.contains('/')),
            PathPredicate::Pattern(regex) => regex.is_match(path),
        }
    }
}

/// `rewrite_path` filter: regex over the path with `${name}` replacement.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    regex: Regex,
    replacement: String,
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, String> {
        let regex = Regex::new(pattern).map_err(|e| e.to_string())?;
        Ok(Self {
            regex,
            replacement: replacement.to_string(),
        })
    }

    pub fn apply(&self, path: &str) -> String {
        let rewritten = self.regex.replace_all(path, self.replacement.as_str());
        if rewritten.starts_with('/') {
            rewritten.into_owned()
        } else {
            format!("/{rewritten}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerBinding {
    pub name: String,
    pub fallback_path: Option<String>,
    pub policy: BreakerPolicy,
}

#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub id: String,
    pub pattern: String,
    pub predicate: PathPredicate,
    pub target: RouteTarget,
    pub rewrites: Vec<PathRewrite>,
    pub breaker: Option<BreakerBinding>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl CompiledRoute {
    pub fn compile(
        definition: &RouteDefinition,
        breakers: &CircuitBreakersConfig,
    ) -> Result<Self, RouteError> {
        let route = definition.id.clone();
        let predicate =
            PathPredicate::parse(&definition.path).map_err(|reason| RouteError::InvalidPattern {
                route: route.clone(),
                pattern: definition.path.clone(),
                reason,
            })?;
        let target =
            RouteTarget::parse(&definition.uri).map_err(|reason| RouteError::InvalidTarget {
                route: route.clone(),
                uri: definition.uri.clone(),
                reason,
            })?;

        let mut rewrites = Vec::new();
        let mut breaker = None;
        let mut retry = None;
        let mut rate_limit = None;

        for filter in &definition.filters {
            match filter {
                FilterSpec::RewritePath {
                    pattern,
                    replacement,
                } => {
                    let rewrite = PathRewrite::new(pattern, replacement).map_err(|reason| {
                        RouteError::InvalidRewrite {
                            route: route.clone(),
                            pattern: pattern.clone(),
                            reason,
                        }
                    })?;
                    rewrites.push(rewrite);
                }
                FilterSpec::CircuitBreaker {
                    name,
                    fallback_path,
                } => {
                    ensure_single(&route, "circuit_breaker", breaker.is_some())?;
                    if name.trim().is_empty() {
                        return Err(invalid_filter(&route, "circuit_breaker", "name is empty"));
                    }
                    let policy = BreakerPolicy::from_settings(&breakers.settings_for(name))
                        .map_err(|reason| invalid_filter(&route, "circuit_breaker", reason))?;
                    breaker = Some(BreakerBinding {
                        name: name.clone(),
                        fallback_path: fallback_path.clone(),
                        policy,
                    });
                }
                FilterSpec::Retry(config) => {
                    ensure_single(&route, "retry", retry.is_some())?;
                    let policy = RetryPolicy::from_config(config)
                        .map_err(|reason| invalid_filter(&route, "retry", reason))?;
                    retry = Some(policy);
                }
                FilterSpec::RequestRateLimiter(config) => {
                    ensure_single(&route, "request_rate_limiter", rate_limit.is_some())?;
                    rate_limit = Some(config.clone());
                }
            }
        }

        Ok(Self {
            id: route,
            pattern: definition.path.clone(),
            predicate,
            target,
            rewrites,
            breaker,
            retry: retry.unwrap_or_default(),
            rate_limit,
        })
    }

    /// Apply every rewrite filter, in declaration order, to `path`.
    pub fn rewrite_path(&self, path: &str) -> String {
        self.rewrites
            .iter()
            .fold(path.to_string(), |current, rewrite| rewrite.apply(&current))
    }
}

fn ensure_single(route: &str, filter: &'static str, present: bool) -> Result<(), RouteError> {
    if present {
        return Err(RouteError::DuplicateFilter {
            route: route.to_string(),
            filter,
        });
    }
    Ok(())
}

fn invalid_filter(route: &str, filter: &'static str, reason: impl Into<String>) -> RouteError {
    RouteError::InvalidFilter {
        route: route.to_string(),
        filter,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn compile(
        definitions: &[RouteDefinition],
        breakers: &CircuitBreakersConfig,
    ) -> Result<Self, RouteError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !seen.insert(definition.id.as_str()) {
                return Err(RouteError::DuplicateId {
                    route: definition.id.clone(),
                });
            }
            routes.push(Arc::new(CompiledRoute::compile(definition, breakers)?));
        }
        Ok(Self { routes })
    }

    /// First declared route whose predicate accepts `path`.
    pub fn match_path(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .iter()
            .find(|r| r.predicate.matches(path))
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
