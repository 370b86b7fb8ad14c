//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the registry and materialize every configured connection
//! - Start background tasks (health monitor, config reload)
//! - Hand back everything shutdown needs to stop them again
//!
//! # Design Decisions
//! - Logging and metrics are installed by the caller before `start`, so
//!   startup itself is observable
//! - A failed load closes whatever was already opened before returning

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::watcher::ConfigWatcher;
use crate::config::RegistryConfig;
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::registry::{Registry, RegistryError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Running services.
pub struct Services {
    pub registry: Arc<Registry>,
    /// The config currently applied; swapped on every reload.
    pub config: Arc<ArcSwap<RegistryConfig>>,
    tasks: Vec<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

/// Bring the registry up from `config`. When `watch` is set the file is
/// watched and changes are reconciled into the live registry.
pub async fn start(
    config: RegistryConfig,
    watch: Option<&Path>,
    shutdown: &Shutdown,
) -> Result<Services, StartupError> {
    let registry = Arc::new(
        Registry::builder()
            .with_default_factories()
            .health_timeout(Duration::from_secs(config.health_monitor.timeout_secs.max(1)))
            .build(),
    );

    if let Err(e) = registry.load_from_config(&config).await {
        if let Err(close) = registry.close().await {
            tracing::warn!(error = %close, "Cleanup after failed startup was incomplete");
        }
        return Err(e.into());
    }

    let mut tasks = Vec::new();
    let monitor = HealthMonitor::new(registry.clone(), config.health_monitor.clone());
    tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

    let current = Arc::new(ArcSwap::from_pointee(config.clone()));
    let watcher = match watch {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, config);
            let handle = watcher.run()?;
            tasks.push(tokio::spawn(apply_reloads(
                registry.clone(),
                current.clone(),
                updates,
                shutdown.subscribe(),
            )));
            Some(handle)
        }
        None => None,
    };

    tracing::info!(connections = registry.len().await, "Startup complete");
    Ok(Services {
        registry,
        config: current,
        tasks,
        watcher,
    })
}

async fn apply_reloads(
    registry: Arc<Registry>,
    current: Arc<ArcSwap<RegistryConfig>>,
    mut updates: mpsc::UnboundedReceiver<RegistryConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(next) = update else { break };
                let report = registry.reconcile(&next).await;
                if !report.failed.is_empty() {
                    tracing::warn!(failed = report.failed.len(), "Config applied partially");
                }
                current.store(Arc::new(next));
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Config reload task exiting");
}

impl Services {
    /// Stop background tasks (waiting at most `grace`), then close every
    /// connection.
    pub async fn stop(self, shutdown: &Shutdown, grace: Duration) -> Result<(), RegistryError> {
        shutdown.trigger();
        drop(self.watcher);

        let tasks = futures_util::future::join_all(self.tasks);
        if tokio::time::timeout(grace, tasks).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "Background tasks did not stop in time");
        }

        self.registry.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn config() -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config
            .connections
            .insert("db".to_string(), ConnectionConfig::new("sqlite", ":memory:"));
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let shutdown = Shutdown::new();
        let services = start(config(), None, &shutdown).await.unwrap();
        assert_eq!(services.registry.names().await, vec!["db"]);
        assert_eq!(services.config.load().connections.len(), 1);

        let registry = services.registry.clone();
        services.stop(&shutdown, Duration::from_secs(5)).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_load_names_the_connection() {
        let mut config = config();
        config
            .connections
            .insert("queue".to_string(), ConnectionConfig::new("mqtt", "mqtt://localhost"));

        let err = start(config, None, &Shutdown::new()).await.err().unwrap();
        assert!(matches!(
            err,
            StartupError::Registry(RegistryError::Load { ref name, .. }) if name == "queue"
        ));
    }

    #[tokio::test]
    async fn test_reload_reconciles_and_swaps_config() {
        let registry = Arc::new(Registry::builder().with_default_factories().build());
        registry.load_from_config(&config()).await.unwrap();
        let current = Arc::new(ArcSwap::from_pointee(config()));

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(apply_reloads(registry.clone(), current.clone(), rx, stop_rx));

        let mut next = config();
        next.connections
            .insert("other".to_string(), ConnectionConfig::new("sqlite", ":memory:"));
        tx.send(next).unwrap();
        drop(tx);
        task.await.unwrap();
        drop(stop_tx);

        assert_eq!(registry.names().await, vec!["db", "other"]);
        assert_eq!(current.load().connections.len(), 2);
        registry.close().await.unwrap();
    }
}
