use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind};
use tokio::sync::{mpsc, watch};

use crate::{
    config::{loader::load_config, models::GatewayConfig, validation::GatewayConfigValidator},
    ports::config_provider::ConfigProvider,
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Reads the gateway configuration from a file and republishes it when the file's
/// contents change.
///
/// Editors often save by writing a temp file and renaming it over the original, so the
/// parent directory is watched and events are filtered by file name.
pub struct FileConfigProvider {
    path: PathBuf,
    file_name: OsString,
    debounce: Duration,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre!("Config path has no file name: {}", path.display()))?
            .to_owned();
        Ok(Self {
            path,
            file_name,
            debounce: DEFAULT_DEBOUNCE,
        })
    }

    /// Quiet period after a change before the file is re-read. Bursts of events inside
    /// it collapse into one reload.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

fn touches_config(file_name: &OsStr, event: &Event) -> bool {
    changes_contents(&event.kind) && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

/// Whether an event can have changed what the file parses to. Metadata updates, reads
/// and deletions cannot produce a new generation.
fn changes_contents(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        EventKind::Remove(_) | EventKind::Access(_) | EventKind::Any | EventKind::Other => false,
    }
}

async fn load_validated(path: &Path) -> Result<GatewayConfig> {
    let path_str = path
        .to_str()
        .ok_or_else(|| eyre!("Invalid UTF-8 path: {}", path.display()))?;
    let config = load_config(path_str).await?;
    GatewayConfigValidator::validate(&config)
        .wrap_err_with(|| format!("Invalid configuration in {path_str}"))?;
    Ok(config)
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        load_validated(&self.path).await
    }

    fn watch(&self) -> Result<mpsc::Receiver<GatewayConfig>> {
        // Change counter bumped from notify's thread; the reload task only needs to know
        // that something happened since it last looked.
        let (changed_tx, mut changed_rx) = watch::channel(0u64);
        let (config_tx, config_rx) = mpsc::channel(1);

        let file_name = self.file_name.clone();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) if touches_config(&file_name, &event) => {
                    tracing::debug!(kind = ?event.kind, "Config file changed");
                    changed_tx.send_modify(|count| *count += 1);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config file watch error"),
            })
            .wrap_err("Failed to create config file watcher")?;
        watcher
            .watch(self.watch_dir(), RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch {}", self.watch_dir().display()))?;

        let path = self.path.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            // Owned by the task so notifications stop with it
            let _watcher = watcher;
            loop {
                tokio::select! {
                    changed = changed_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = config_tx.closed() => break,
                }
                tokio::time::sleep(debounce).await;
                changed_rx.mark_unchanged();

                tracing::info!(config = %path.display(), "Reloading configuration");
                match load_validated(&path).await {
                    Ok(config) => {
                        if config_tx.send(config).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(
                        error = ?e,
                        "Rejected configuration change, keeping the active generation"
                    ),
                }
            }
            tracing::debug!("Config file watch stopped");
        });

        Ok(config_rx)
    }
}
