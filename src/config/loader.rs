use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, INI (by extension, YAML otherwise).
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{FilterSpec, KeyResolverKind, RegistryConfig};

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
registry:
  type: static
  services:
    - name: PRODUCT-SERVICE
      instances: ["http://127.0.0.1:8081"]
rate_limit:
  key_resolver: user_header
  replenish_rate: 10
  burst_capacity: 20
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
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].id, "product-service");
        assert_eq!(config.routes[0].filters.len(), 2);
        assert!(matches!(
            &config.routes[1].filters[0],
            FilterSpec::RewritePath { replacement, .. } if replacement == "/api/products/categories/${segment}"
        ));
        assert!(matches!(config.registry, RegistryConfig::Static { ref services } if services[0].name == "PRODUCT-SERVICE"));
        let rate_limit = config.rate_limit.unwrap();
        assert_eq!(rate_limit.key_resolver, KeyResolverKind::UserHeader);
        assert_eq!(rate_limit.burst_capacity, 20);
        // Defaults fill in what the file omits
        assert_eq!(config.fallbacks.len(), 4);
        assert_eq!(config.timeouts.attempt, "5s");
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "registry": {"type": "eureka", "url": "http://localhost:8761/eureka"},
  "load_balance": "random",
  "routes": [
    {"id": "orders", "path": "/api/orders/**", "uri": "lb://ORDER-SERVICE"}
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes.len(), 1);
        assert!(matches!(
            config.registry,
            RegistryConfig::Eureka { ref cache_ttl, .. } if cache_ttl == "5s"
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        assert!(load_config("/nonexistent/portico.yaml").await.is_err());
    }
}
