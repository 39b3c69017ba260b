use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::GatewayConfig;

/// Source of gateway configuration generations.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load and validate the current configuration.
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Start delivering every later generation that loads and validates cleanly.
    ///
    /// Rejected generations are logged and skipped. Dropping the receiver stops the
    /// watch.
    fn watch(&self) -> Result<mpsc::Receiver<GatewayConfig>>;
}
