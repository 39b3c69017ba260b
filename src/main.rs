use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use portico::{
    adapters::{FileConfigProvider, HttpClientAdapter, HttpHandler, build_registry, router},
    config::{GatewayConfig, GatewayConfigValidator},
    core::GatewayService,
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup::{self, LogFormat},
    utils::GracefulShutdown,
};
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (YAML, JSON or TOML)
    #[clap(short, long, default_value = "gateway.yaml", global = true)]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate,
    /// Initialize a new configuration file
    Init,
    /// Start the gateway server (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => validate_config_command(&args.config).await,
        Commands::Init => init_config_command(&args.config).await,
        Commands::Serve => serve(&args.config, args.log_format).await,
    }
}

async fn serve(config_path: &str, log_format: LogFormat) -> Result<()> {
    tracing_setup::init(log_format)?;

    tracing::info!(config = %config_path, "Loading initial configuration");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );

    let config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    // The exporter binds once; later reloads cannot move it
    metrics::init_metrics(&config.metrics)?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let sweep_interval = humantime::parse_duration(&config.limiter_sweep_interval)
        .context("Failed to parse limiter_sweep_interval")?;

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let registry = build_registry(&config.registry)?;

    for route in &config.routes {
        tracing::info!(route = %route.id, path = %route.path, uri = %route.uri, "Configured route");
    }

    let gateway = Arc::new(GatewayService::new(config, registry, http_client)?);

    let watcher = spawn_config_watcher(config_provider.clone(), gateway.clone());
    let sweeper = spawn_limiter_sweeper(gateway.clone(), sweep_interval);

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    let signal_handler = tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!(error = ?e, "Signal handler error");
        }
    });

    let app = router(Arc::new(HttpHandler::new(gateway)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(%addr, "Portico gateway listening");

    let shutdown_for_server = graceful_shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_for_server.wait().await;
        tracing::info!(?reason, "Draining in-flight requests");
    });

    let mut server = tokio::spawn(async move { server.await });

    let server_result = tokio::select! {
        result = &mut server => result.context("Server task failed")?.context("Server error"),
        _ = graceful_shutdown.wait() => {
            match tokio::time::timeout(graceful_shutdown.drain_timeout(), &mut server).await {
                Ok(result) => result.context("Server task failed")?.context("Server error"),
                Err(_) => {
                    tracing::warn!(
                        timeout = ?graceful_shutdown.drain_timeout(),
                        "Drain timeout exceeded, dropping remaining connections"
                    );
                    server.abort();
                    Ok(())
                }
            }
        }
    };

    for task in [watcher, sweeper, signal_handler] {
        task.abort();
    }

    tracing::info!("Graceful shutdown completed");
    tracing_setup::shutdown_tracing();

    server_result
}

/// Apply every configuration generation the provider publishes. Generations the
/// provider rejects never reach the gateway, so the running one stays active.
fn spawn_config_watcher(
    provider: Arc<dyn ConfigProvider>,
    gateway: Arc<GatewayService>,
) -> JoinHandle<()> {
    let updates = provider.watch();

    tokio::spawn(async move {
        let mut updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = ?e, "Config watch unavailable; hot reload disabled");
                return;
            }
        };
        tracing::info!("Config watcher task started.");

        while let Some(config) = updates.recv().await {
            let result = match build_registry(&config.registry) {
                Ok(registry) => gateway.reload(config, registry).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(
                    error = ?e,
                    "Failed to apply configuration. Keeping old configuration."
                );
            }
        }
        tracing::info!("Config watcher task is shutting down.");
    })
}

fn spawn_limiter_sweeper(gateway: Arc<GatewayService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let before = gateway.tracked_rate_limit_keys();
            gateway.evict_idle_rate_limit_keys();
            tracing::debug!(
                before,
                after = gateway.tracked_rate_limit_keys(),
                "Evicted idle rate limiter keys"
            );
        }
    })
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use portico::config::loader::load_config;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Registry: {}", registry_label(&config));
            println!(
                "   • Gateway Rate Limit: {}",
                if config.rate_limit.is_some() { "enabled" } else { "disabled" }
            );
            println!("   • Fallback Endpoints: {}", config.fallbacks.len());
            if config.metrics.enabled {
                println!("   • Metrics: {}", config.metrics.listen_addr);
            }
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Route uris must be lb://SERVICE or start with http:// or https://");
            println!("   • Every lb:// service needs an entry in a static registry");
            println!("   • Circuit breaker fallback_path must name a configured fallback");
            println!("   • Durations use humantime units (e.g. '50ms', '5s', '1m')");
            std::process::exit(1);
        }
    }
}

fn registry_label(config: &GatewayConfig) -> String {
    match &config.registry {
        portico::config::RegistryConfig::Static { services } => {
            format!("static ({} services)", services.len())
        }
        portico::config::RegistryConfig::Eureka { url, .. } => format!("eureka ({url})"),
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the server");
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# Portico gateway configuration

listen_addr: "0.0.0.0:8080"

# Prometheus scrape endpoint (GET /metrics)
metrics:
  enabled: true
  listen_addr: "0.0.0.0:9090"

# Service registry used to resolve lb:// targets.
# For Eureka use:
#   registry:
#     type: eureka
#     url: http://localhost:8761/eureka
registry:
  type: static
  services:
    - name: PRODUCT-SERVICE
      instances: ["http://127.0.0.1:8081"]
    - name: ORDER-SERVICE
      instances: ["http://127.0.0.1:8082"]
    - name: CART-SERVICE
      instances: ["http://127.0.0.1:8083"]
    - name: PAYMENT-SERVICE
      instances: ["http://127.0.0.1:8084"]

load_balance: round_robin

circuit_breakers:
  defaults:
    failure_threshold: 5
    open_duration: 30s

# Applies to every route without its own request_rate_limiter filter
rate_limit:
  key_resolver: user_header
  replenish_rate: 10
  burst_capacity: 20

timeouts:
  attempt: 5s
  request: 30s

routes:
  - id: product-service
    path: /api/products/**
    uri: lb://PRODUCT-SERVICE
    filters:
      - type: circuit_breaker
        name: productServiceCB
        fallback_path: /fallback/products
      - type: retry
        max_attempts: 3
        methods: [GET]

  - id: categories
    path: /api/categories/**
    uri: lb://PRODUCT-SERVICE
    filters:
      - type: rewrite_path
        pattern: "/api/categories/(?<segment>.*)"
        replacement: "/api/products/categories/${segment}"

  - id: order-service
    path: /api/orders/**
    uri: lb://ORDER-SERVICE
    filters:
      - type: circuit_breaker
        name: orderServiceCB
        fallback_path: /fallback/orders

  - id: cart-service
    path: /api/cart/**
    uri: lb://CART-SERVICE
    filters:
      - type: circuit_breaker
        name: cartServiceCB
        fallback_path: /fallback/cart

  - id: payment-service
    path: /api/payments/**
    uri: lb://PAYMENT-SERVICE
    filters:
      - type: circuit_breaker
        name: paymentServiceCB
        fallback_path: /fallback/payments
"#;

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        write!(file, "{DEFAULT_CONFIG}").unwrap();

        let config =
            portico::config::loader::load_config_sync(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.routes.len(), 5);
        GatewayConfigValidator::validate(&config).unwrap();
    }

    #[test]
    fn test_cli_defaults() {
        let args = Args::parse_from(["portico"]);
        assert!(args.command.is_none());
        assert_eq!(args.config, "gateway.yaml");
        assert_eq!(args.log_format, LogFormat::Json);

        let args = Args::parse_from(["portico", "validate", "--config", "other.yaml"]);
        assert!(matches!(args.command, Some(Commands::Validate)));
        assert_eq!(args.config, "other.yaml");
    }
}
