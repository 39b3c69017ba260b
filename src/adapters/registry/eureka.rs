//! Client for a Eureka discovery server.
//!
//! Instances are fetched with `GET {url}/apps/{SERVICE}` and cached per service for
//! `cache_ttl`. When a refresh fails and a previous snapshot exists, the stale snapshot
//! is served and the failure logged.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, StatusCode, header};
use scc::HashMap;
use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    core::instance::{InstanceStatus, ServiceInstance},
    ports::service_registry::{RegistryError, RegistryResult, ServiceRegistry},
};

#[derive(Debug, Deserialize)]
struct ApplicationEnvelope {
    application: Application,
}

#[derive(Debug, Deserialize)]
struct Application {
    #[serde(default)]
    instance: OneOrMany<EurekaInstance>,
}

/// Eureka renders a single instance as an object instead of a one-element array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EurekaInstance {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    host_name: Option<String>,
    #[serde(default)]
    ip_addr: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    port: Option<EurekaPort>,
    #[serde(default)]
    secure_port: Option<EurekaPort>,
}

#[derive(Debug, Deserialize)]
struct EurekaPort {
    #[serde(rename = "$")]
    port: u16,
    #[serde(rename = "@enabled", default)]
    enabled: Option<serde_json::Value>,
}

impl EurekaPort {
    fn is_enabled(&self) -> bool {
        match &self.enabled {
            Some(serde_json::Value::Bool(enabled)) => *enabled,
            Some(serde_json::Value::String(enabled)) => enabled.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

impl EurekaInstance {
    fn into_service_instance(self) -> Option<ServiceInstance> {
        let host = self
            .ip_addr
            .filter(|ip| !ip.is_empty())
            .or(self.host_name.filter(|h| !h.is_empty()))?;
        let status = InstanceStatus::parse(self.status.as_deref().unwrap_or("UNKNOWN"));

        let (port, secure) = match (&self.secure_port, &self.port) {
            (Some(secure), _) if secure.is_enabled() => (secure.port, true),
            (_, Some(plain)) => (plain.port, false),
            _ => return None,
        };

        let mut instance = ServiceInstance::new(host, port, secure, status);
        if let Some(id) = self.instance_id.filter(|id| !id.is_empty()) {
            instance.instance_id = id;
        }
        Some(instance)
    }
}

struct CachedSnapshot {
    fetched_at: Instant,
    instances: Arc<[ServiceInstance]>,
}

pub struct EurekaRegistry {
    base_url: String,
    client: Client,
    cache_ttl: Duration,
    cache: HashMap<String, Arc<CachedSnapshot>>,
}

impl EurekaRegistry {
    pub fn new(base_url: &str, timeout: Duration, cache_ttl: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build Eureka HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            cache_ttl,
            cache: HashMap::new(),
        })
    }

    async fn fetch(&self, service: &str) -> RegistryResult<Arc<[ServiceInstance]>> {
        let url = format!("{}/apps/{service}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("GET {url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(Arc::from(Vec::new())),
            status if !status.is_success() => {
                return Err(RegistryError::Unavailable(format!("GET {url}: HTTP {status}")));
            }
            _ => {}
        }

        let envelope = response
            .json::<ApplicationEnvelope>()
            .await
            .map_err(|e| RegistryError::InvalidResponse(format!("GET {url}: {e}")))?;

        let instances: Vec<ServiceInstance> = envelope
            .application
            .instance
            .into_vec()
            .into_iter()
            .filter_map(EurekaInstance::into_service_instance)
            .collect();
        tracing::debug!(service, count = instances.len(), "Fetched instances from Eureka");
        Ok(Arc::from(instances))
    }
}

#[async_trait]
impl ServiceRegistry for EurekaRegistry {
    async fn instances(&self, service: &str) -> RegistryResult<Arc<[ServiceInstance]>> {
        let key = service.to_ascii_uppercase();
        let cached = self
            .cache
            .get_async(&key)
            .await
            .map(|entry| entry.get().clone());

        if let Some(cached) = &cached {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.instances.clone());
            }
        }

        match self.fetch(&key).await {
            Ok(instances) => {
                let snapshot = Arc::new(CachedSnapshot {
                    fetched_at: Instant::now(),
                    instances: instances.clone(),
                });
                match self.cache.entry_async(key).await {
                    scc::hash_map::Entry::Occupied(mut entry) => *entry.get_mut() = snapshot,
                    scc::hash_map::Entry::Vacant(entry) => {
                        entry.insert_entry(snapshot);
                    }
                }
                Ok(instances)
            }
            Err(err) => match cached {
                Some(stale) => {
                    tracing::warn!(service, error = %err, "Eureka refresh failed, serving stale instances");
                    Ok(stale.instances.clone())
                }
                None => Err(err),
            },
        }
    }

    fn kind(&self) -> &'static str {
        "eureka"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc as StdArc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use axum::{Json, Router, extract::Path, http::StatusCode as AxumStatus, routing::get};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone, Default)]
    struct ServerState {
        hits: StdArc<AtomicUsize>,
        failing: StdArc<AtomicBool>,
    }

    async fn spawn_eureka(state: ServerState) -> String {
        let app = Router::new().route(
            "/eureka/apps/{service}",
            get(move |Path(service): Path<String>| {
                let state = state.clone();
                async move {
                    state.hits.fetch_add(1, Ordering::SeqCst);
                    if state.failing.load(Ordering::SeqCst) {
                        return Err(AxumStatus::INTERNAL_SERVER_ERROR);
                    }
                    match service.as_str() {
                        "PRODUCT-SERVICE" => Ok(Json(json!({
                            "application": {
                                "name": "PRODUCT-SERVICE",
                                "instance": [
                                    {
                                        "instanceId": "products-1",
                                        "hostName": "products-1.local",
                                        "ipAddr": "10.0.0.5",
                                        "status": "UP",
                                        "port": {"$": 8081, "@enabled": "true"},
                                        "securePort": {"$": 443, "@enabled": "false"}
                                    },
                                    {
                                        "instanceId": "products-2",
                                        "hostName": "products-2.local",
                                        "ipAddr": "10.0.0.6",
                                        "status": "DOWN",
                                        "port": {"$": 8081, "@enabled": "true"}
                                    }
                                ]
                            }
                        }))),
                        "ORDER-SERVICE" => Ok(Json(json!({
                            "application": {
                                "name": "ORDER-SERVICE",
                                "instance": {
                                    "instanceId": "orders-1",
                                    "hostName": "orders.local",
                                    "ipAddr": "",
                                    "status": "UP",
                                    "port": {"$": 8082, "@enabled": "true"},
                                    "securePort": {"$": 8443, "@enabled": "true"}
                                }
                            }
                        }))),
                        _ => Err(AxumStatus::NOT_FOUND),
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/eureka")
    }

    fn registry(url: &str, ttl: Duration) -> EurekaRegistry {
        EurekaRegistry::new(url, Duration::from_secs(2), ttl).unwrap()
    }

    #[tokio::test]
    async fn test_parses_instances() {
        let url = spawn_eureka(ServerState::default()).await;
        let registry = registry(&url, Duration::from_secs(5));

        let products = registry.instances("product-service").await.unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].instance_id, "products-1");
        assert_eq!(products[0].host, "10.0.0.5");
        assert_eq!(products[0].port, 8081);
        assert!(!products[0].secure);
        assert_eq!(products[1].status, InstanceStatus::Down);

        // Single-object form, host name fallback and secure port
        let orders = registry.instances("ORDER-SERVICE").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].host, "orders.local");
        assert_eq!(orders[0].port, 8443);
        assert!(orders[0].secure);
    }

    #[tokio::test]
    async fn test_unknown_service_is_empty() {
        let url = spawn_eureka(ServerState::default()).await;
        let registry = registry(&url, Duration::from_secs(5));
        assert!(registry.instances("CART-SERVICE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_are_cached() {
        let state = ServerState::default();
        let url = spawn_eureka(state.clone()).await;
        let registry = registry(&url, Duration::from_secs(60));

        registry.instances("PRODUCT-SERVICE").await.unwrap();
        registry.instances("PRODUCT-SERVICE").await.unwrap();
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serves_stale_snapshot_on_failure() {
        let state = ServerState::default();
        let url = spawn_eureka(state.clone()).await;
        let registry = registry(&url, Duration::from_millis(1));

        let fresh = registry.instances("PRODUCT-SERVICE").await.unwrap();
        state.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stale = registry.instances("PRODUCT-SERVICE").await.unwrap();
        assert_eq!(fresh, stale);
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);

        // Nothing cached for this one
        let err = registry.instances("ORDER-SERVICE").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let registry = registry("http://127.0.0.1:1/eureka", Duration::from_secs(5));
        assert!(registry.instances("PRODUCT-SERVICE").await.is_err());
    }
}
