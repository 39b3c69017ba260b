pub mod config_providers;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod registry;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, router};
pub use middleware::*;
pub use registry::{EurekaRegistry, StaticRegistry, build_registry};
