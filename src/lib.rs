//! Portico - an edge gateway for a fleet of HTTP services.
//!
//! Every request entering the gateway is matched against an ordered route table and,
//! when a route matches, runs through that route's filter chain before being forwarded
//! to a backend instance:
//!
//! - per-key token bucket rate limiting (by caller header or remote address)
//! - named circuit breakers with a canned fallback response while open
//! - bounded retries with exponential backoff for idempotent methods
//! - path rewriting with named regex captures
//! - `lb://SERVICE` targets resolved through a service registry (static or Eureka)
//!   and spread across healthy instances by round-robin or random selection
//!
//! Configuration is loaded from YAML, JSON or TOML, validated up front and hot-reloaded
//! when the file changes. Circuit breaker state survives reloads.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{GatewayService, HttpClientAdapter, HttpHandler, adapters};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = portico::config::loader::load_config("gateway.yaml").await?;
//! let registry = adapters::build_registry(&config.registry)?;
//! let gateway = GatewayService::new(config, registry, Arc::new(HttpClientAdapter::new()?))?;
//! let app = adapters::router(Arc::new(HttpHandler::new(Arc::new(gateway))));
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the request pipeline inside `core`.
//!
//! # Error Handling
//! Domain operations return typed errors (`thiserror`); wiring and startup paths return
//! `eyre::Result<T>` with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared mutable maps use `scc::HashMap`. The active configuration generation is swapped
//! atomically with `arc-swap`, so in-flight requests finish on the generation they started.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
