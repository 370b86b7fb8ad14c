//! Connection registry.
//!
//! # Responsibilities
//! - Map protocol names to factories and connection names to live connections
//! - Materialize connections from config, one name at a time or in bulk
//! - Filter by behavior, capability or protocol
//! - Fan out health checks and close everything on shutdown
//! - Reconcile the live set with a reloaded config
//!
//! # Data Flow
//! ```text
//! add_connection(name, config)
//!     → name free? (read lock)
//!     → factory for config.protocol
//!     → factory.create_connection (no lock held)
//!     → insert (write lock, name re-checked)
//! ```
//!
//! # Design Decisions
//! - No lock is held across factory calls or probes
//! - A failed add leaves the registry exactly as it was
//! - Passed around by `Arc`; there is no global registry

pub mod error;
pub mod extract;

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::adapters::{self, MessageQueue};
use crate::config::{ConnectionConfig, RegistryConfig};
use crate::connection::{
    Behavior, Capability, Connection, ConnectionFactory, ConnectionState, HealthStatus, Repository,
};
use crate::observability::metrics;

pub use error::RegistryError;
pub use extract::{extract, ExtractError};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    connection: Arc<dyn Connection>,
    config: ConnectionConfig,
}

/// Outcome of [`Registry::reconcile`].
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub replaced: Vec<String>,
    /// Names that could not be brought in line, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty() && self.failed.is_empty()
    }
}

pub struct Registry {
    connections: RwLock<HashMap<String, Entry>>,
    factories: RwLock<HashMap<String, Arc<dyn ConnectionFactory>>>,
    health_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Registry {
    /// Empty registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Register a factory, replacing any previous one for the same protocol.
    pub async fn register_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        let protocol = factory.protocol().to_string();
        if self.factories.write().await.insert(protocol.clone(), factory).is_some() {
            tracing::debug!(protocol = %protocol, "Factory replaced");
        }
    }

    /// Registered protocol names, sorted.
    pub async fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<_> = self.factories.read().await.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub async fn add_connection(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Connection>, RegistryError> {
        if self.connections.read().await.contains_key(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }

        let factory = self
            .factories
            .read()
            .await
            .get(&config.protocol)
            .cloned()
            .ok_or_else(|| RegistryError::UnsupportedProtocol {
                name: name.to_string(),
                protocol: config.protocol.clone(),
            })?;

        let connection = factory
            .create_connection(config)
            .await
            .map_err(|source| RegistryError::CreationFailed {
                name: name.to_string(),
                protocol: config.protocol.clone(),
                source,
            })?;

        let mut connections = self.connections.write().await;
        if connections.contains_key(name) {
            drop(connections);
            // Lost a race with another add of the same name.
            if let Err(e) = connection.close().await {
                tracing::warn!(name = %name, error = %e, "Failed to close duplicate connection");
            }
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        connections.insert(
            name.to_string(),
            Entry {
                connection: connection.clone(),
                config: config.clone(),
            },
        );
        drop(connections);

        metrics::record_connection_state(name, connection.protocol(), connection.state());
        tracing::info!(
            name = %name,
            protocol = %connection.protocol(),
            state = %connection.state(),
            "Connection added"
        );
        Ok(connection)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .await
            .get(name)
            .map(|entry| entry.connection.clone())
    }

    /// The config a connection was built from.
    pub async fn config_of(&self, name: &str) -> Option<ConnectionConfig> {
        self.connections.read().await.get(name).map(|entry| entry.config.clone())
    }

    async fn filtered<F>(&self, keep: F) -> Vec<(String, Arc<dyn Connection>)>
    where
        F: Fn(&dyn Connection) -> bool,
    {
        let mut matches: Vec<_> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| keep(entry.connection.as_ref()))
            .map(|(name, entry)| (name.clone(), entry.connection.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches
    }

    pub async fn by_behavior(&self, behavior: Behavior) -> Vec<(String, Arc<dyn Connection>)> {
        self.filtered(|c| c.has_behavior(behavior)).await
    }

    pub async fn by_capability(&self, capability: Capability) -> Vec<(String, Arc<dyn Connection>)> {
        self.filtered(|c| c.has_capability(capability)).await
    }

    pub async fn by_protocol(&self, protocol: &str) -> Vec<(String, Arc<dyn Connection>)> {
        self.filtered(|c| c.protocol() == protocol).await
    }

    /// Connection names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Remove and close. A failed close is logged; the name is gone either way.
    pub async fn remove_connection(&self, name: &str) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Err(e) = entry.connection.close().await {
            tracing::warn!(name = %name, error = %e, "Connection close failed during removal");
        }
        metrics::record_connection_state(name, entry.connection.protocol(), ConnectionState::Disconnected);
        tracing::info!(name = %name, "Connection removed");
        Ok(())
    }

    /// Probe every connection concurrently. A probe that outlives the
    /// health timeout is reported as Error.
    pub async fn health_check(&self) -> HashMap<String, HealthStatus> {
        let snapshot: Vec<_> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.connection.clone()))
            .collect();

        let timeout = self.health_timeout;
        let probes = snapshot.into_iter().map(|(name, connection)| async move {
            let status = match tokio::time::timeout(timeout, connection.health_check()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(name = %name, timeout_ms = timeout.as_millis() as u64, "Health check timed out");
                    HealthStatus::unprobed(
                        ConnectionState::Error,
                        "health check timed out",
                        Some(format!("no result within {:?}", timeout)),
                    )
                }
            };
            metrics::record_health_check(&name, status.latency);
            metrics::record_connection_state(&name, connection.protocol(), status.state);
            (name, status)
        });

        join_all(probes).await.into_iter().collect()
    }

    /// Close every connection. The registry is empty afterwards even if
    /// some closes failed; those failures are returned together.
    pub async fn close(&self) -> Result<(), RegistryError> {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        let count = drained.len();

        let results = join_all(drained.into_iter().map(|(name, entry)| async move {
            let result = entry.connection.close().await;
            metrics::record_connection_state(&name, entry.connection.protocol(), ConnectionState::Disconnected);
            (name, result)
        }))
        .await;

        let mut failures: Vec<_> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));

        if failures.is_empty() {
            tracing::info!(closed = count, "Registry closed");
            Ok(())
        } else {
            tracing::warn!(closed = count, failed = failures.len(), "Registry closed with errors");
            Err(RegistryError::Close(failures))
        }
    }

    /// Add every configured connection in name order, stopping at the
    /// first failure. Connections added before it stay registered.
    pub async fn load_from_config(&self, config: &RegistryConfig) -> Result<(), RegistryError> {
        for (name, connection) in &config.connections {
            self.add_connection(name, connection)
                .await
                .map_err(|source| RegistryError::Load {
                    name: name.clone(),
                    source: Box::new(source),
                })?;
        }
        tracing::info!(connections = config.connections.len(), "Connections loaded from config");
        Ok(())
    }

    /// Storage surface of a KeyValue, Document or Relational connection.
    pub async fn get_repository(&self, name: &str) -> Result<Arc<dyn Repository>, RegistryError> {
        let connection = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !Capability::STORAGE.iter().any(|c| connection.has_capability(*c)) {
            return Err(RegistryError::NotRepository(name.to_string()));
        }
        connection
            .into_repository()
            .ok_or_else(|| RegistryError::NotRepository(name.to_string()))
    }

    /// Queue surface of a Queue-capable connection.
    pub async fn get_message_queue(&self, name: &str) -> Result<Arc<dyn MessageQueue>, RegistryError> {
        let connection = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !connection.has_capability(Capability::Queue) {
            return Err(RegistryError::NotMessageQueue(name.to_string()));
        }
        connection
            .into_message_queue()
            .ok_or_else(|| RegistryError::NotMessageQueue(name.to_string()))
    }

    /// Bring the registry in line with `config`: drop names that are gone,
    /// add new ones, rebuild those whose config changed. One failing name
    /// never stops the others.
    pub async fn reconcile(&self, config: &RegistryConfig) -> ReconcileReport {
        let current: BTreeMap<String, ConnectionConfig> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.config.clone()))
            .collect();

        let mut report = ReconcileReport::default();

        for name in current.keys().filter(|n| !config.connections.contains_key(*n)) {
            match self.remove_connection(name).await {
                Ok(()) => report.removed.push(name.clone()),
                Err(e) => report.failed.push((name.clone(), e.to_string())),
            }
        }

        for (name, wanted) in &config.connections {
            match current.get(name) {
                Some(existing) if existing == wanted => {}
                Some(_) => {
                    if let Err(e) = self.remove_connection(name).await {
                        report.failed.push((name.clone(), e.to_string()));
                        continue;
                    }
                    match self.add_connection(name, wanted).await {
                        Ok(_) => report.replaced.push(name.clone()),
                        Err(e) => report.failed.push((name.clone(), e.to_string())),
                    }
                }
                None => match self.add_connection(name, wanted).await {
                    Ok(_) => report.added.push(name.clone()),
                    Err(e) => report.failed.push((name.clone(), e.to_string())),
                },
            }
        }

        for (name, reason) in &report.failed {
            tracing::error!(name = %name, error = %reason, "Reconcile failed for connection");
        }
        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            replaced = report.replaced.len(),
            failed = report.failed.len(),
            "Registry reconciled"
        );
        report
    }
}

/// Options for [`Registry`].
pub struct RegistryBuilder {
    factories: Vec<Arc<dyn ConnectionFactory>>,
    health_timeout: Duration,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            factories: Vec::new(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

impl RegistryBuilder {
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// sqlite, redis, amqp, http and otlp.
    pub fn with_default_factories(mut self) -> Self {
        self.factories.extend(adapters::default_factories());
        self
    }

    /// Upper bound on a single connection's health probe.
    pub fn health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Later factories replace earlier ones for the same protocol.
    pub fn build(self) -> Registry {
        let factories = self
            .factories
            .into_iter()
            .map(|f| (f.protocol().to_string(), f))
            .collect();
        Registry {
            connections: RwLock::new(HashMap::new()),
            factories: RwLock::new(factories),
            health_timeout: self.health_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionError, ConnectionResult, StateCell};
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process connection with scripted health and close behavior.
    struct Fake {
        state: StateCell,
        health_delay: Duration,
        fail_close: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for Fake {
        fn behaviors(&self) -> &'static [Behavior] {
            &[Behavior::Stateless]
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Cache]
        }

        fn protocol(&self) -> &'static str {
            "fake"
        }

        fn state(&self) -> ConnectionState {
            self.state.get()
        }

        async fn health_check(&self) -> HealthStatus {
            tokio::time::sleep(self.health_delay).await;
            HealthStatus::unprobed(self.state.get(), "fake", None)
        }

        async fn close(&self) -> ConnectionResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.state.set(ConnectionState::Disconnected);
            if self.fail_close {
                Err(ConnectionError::operation("fake", "close", "refused"))
            } else {
                Ok(())
            }
        }

        fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            Some(Arc::new(String::from("fake-handle")))
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        fn protocol(&self) -> &'static str {
            "fake"
        }

        async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
            if config.property_or("fail_create", false)? {
                return Err(ConnectionError::connect("fake", "refused"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Fake {
                state: StateCell::new(ConnectionState::Ready),
                health_delay: config.duration_ms("health_delay_ms")?.unwrap_or(Duration::ZERO),
                fail_close: config.property_or("fail_close", false)?,
                closes: self.closes.clone(),
            }))
        }
    }

    fn fake(dsn: &str) -> ConnectionConfig {
        ConnectionConfig::new("fake", dsn)
    }

    fn registry() -> (Registry, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let registry = Registry::builder()
            .with_factory(factory.clone())
            .health_timeout(Duration::from_millis(100))
            .build();
        (registry, factory)
    }

    #[tokio::test]
    async fn test_duplicate_name_keeps_original() {
        let (registry, factory) = registry();
        let first = registry.add_connection("a", &fake("one")).await.unwrap();
        let err = registry.add_connection("a", &fake("two")).await.err().unwrap();
        assert!(matches!(err, RegistryError::AlreadyExists(ref n) if n == "a"));
        assert!(Arc::ptr_eq(&first, &registry.get("a").await.unwrap()));
        assert_eq!(registry.config_of("a").await.unwrap().dsn.as_deref(), Some("one"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_adds_nothing() {
        let (registry, _) = registry();
        let err = registry
            .add_connection("a", &fake("x").with_property("fail_create", true))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::CreationFailed { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_filters() {
        let (registry, _) = registry();
        registry.add_connection("b", &fake("x")).await.unwrap();
        registry.add_connection("a", &fake("x")).await.unwrap();

        let names = |v: Vec<(String, Arc<dyn Connection>)>| v.into_iter().map(|(n, _)| n).collect::<Vec<_>>();
        assert_eq!(names(registry.by_behavior(Behavior::Stateless).await), vec!["a", "b"]);
        assert!(registry.by_behavior(Behavior::Streaming).await.is_empty());
        assert_eq!(names(registry.by_capability(Capability::Cache).await), vec!["a", "b"]);
        assert_eq!(names(registry.by_protocol("fake").await), vec!["a", "b"]);
        assert!(registry.by_protocol("redis").await.is_empty());
        assert_eq!(registry.names().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove_closes_even_when_close_fails() {
        let (registry, factory) = registry();
        registry
            .add_connection("a", &fake("x").with_property("fail_close", true))
            .await
            .unwrap();
        registry.remove_connection("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.remove_connection("a").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_timeout_reports_error() {
        let (registry, _) = registry();
        registry.add_connection("fast", &fake("x")).await.unwrap();
        registry
            .add_connection("slow", &fake("x").with_property("health_delay_ms", 5_000))
            .await
            .unwrap();

        let report = registry.health_check().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report["fast"].state, ConnectionState::Ready);
        assert_eq!(report["slow"].state, ConnectionState::Error);
        assert!(report["slow"].error.is_some());
    }

    #[tokio::test]
    async fn test_close_empties_and_collects_failures() {
        let (registry, factory) = registry();
        registry.add_connection("ok", &fake("x")).await.unwrap();
        registry
            .add_connection("bad", &fake("x").with_property("fail_close", true))
            .await
            .unwrap();

        let err = registry.close().await.unwrap_err();
        match err {
            RegistryError::Close(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty().await);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 2);
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_stops_at_first_failure() {
        let (registry, _) = registry();
        let mut config = RegistryConfig::default();
        config.connections.insert("a".into(), fake("x"));
        config.connections.insert("b".into(), ConnectionConfig::new("mongo", "x"));
        config.connections.insert("c".into(), fake("x"));

        let err = registry.load_from_config(&config).await.unwrap_err();
        match err {
            RegistryError::Load { name, source } => {
                assert_eq!(name, "b");
                assert!(matches!(*source, RegistryError::UnsupportedProtocol { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.names().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_reconcile() {
        let (registry, _) = registry();
        let mut before = RegistryConfig::default();
        before.connections.insert("keep".into(), fake("x"));
        before.connections.insert("drop".into(), fake("x"));
        before.connections.insert("change".into(), fake("x"));
        registry.load_from_config(&before).await.unwrap();

        let mut after = RegistryConfig::default();
        after.connections.insert("keep".into(), fake("x"));
        after.connections.insert("change".into(), fake("y"));
        after.connections.insert("new".into(), fake("x"));
        after.connections.insert("broken".into(), ConnectionConfig::new("mongo", "x"));

        let report = registry.reconcile(&after).await;
        assert_eq!(report.removed, vec!["drop"]);
        assert_eq!(report.replaced, vec!["change"]);
        assert_eq!(report.added, vec!["new"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(registry.names().await, vec!["change", "keep", "new"]);
        assert_eq!(registry.config_of("change").await.unwrap().dsn.as_deref(), Some("y"));

        let again = registry.reconcile(&after).await;
        assert!(again.removed.is_empty() && again.replaced.is_empty() && again.added.is_empty());
    }

    #[tokio::test]
    async fn test_repository_gate() {
        let (registry, _) = registry();
        registry.add_connection("cache", &fake("x")).await.unwrap();
        assert!(matches!(
            registry.get_repository("cache").await,
            Err(RegistryError::NotRepository(_))
        ));
        assert!(matches!(
            registry.get_repository("missing").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.get_message_queue("cache").await,
            Err(RegistryError::NotMessageQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_extract() {
        let (registry, _) = registry();
        registry.add_connection("a", &fake("x")).await.unwrap();

        let handle = extract::<String>(Some(&registry), "a").await.unwrap();
        assert_eq!(handle.as_str(), "fake-handle");
        assert_eq!(
            extract::<String>(None, "a").await.unwrap_err(),
            ExtractError::RegistryAbsent
        );
        assert_eq!(
            extract::<String>(Some(&registry), "b").await.unwrap_err(),
            ExtractError::NotFound("b".into())
        );
        assert!(matches!(
            extract::<u32>(Some(&registry), "a").await.unwrap_err(),
            ExtractError::TypeMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_later_factory_wins() {
        let registry = Registry::new();
        assert!(registry.protocols().await.is_empty());
        registry.register_factory(Arc::new(FakeFactory::default())).await;
        registry.register_factory(Arc::new(FakeFactory::default())).await;
        assert_eq!(registry.protocols().await, vec!["fake"]);
    }
}
