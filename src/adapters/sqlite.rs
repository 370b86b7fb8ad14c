//! Relational adapter over an sqlx SQLite pool.
//!
//! # Responsibilities
//! - Open the pool and verify it with one ping before handing it out
//! - Classify pool pressure into Connected / Live / Ready
//! - Offer a JSON document repository and raw transactions
//!
//! # Design Decisions
//! - `:memory:` databases exist per connection, so they are pinned to a
//!   single connection that never expires; every caller sees the same data
//! - Each repository collection is its own `(id, body)` table

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection as _, Row, Sqlite, Transaction};
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::repository::validate_collection;
use crate::connection::{
    Behavior, Capability, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ConnectionState, HealthStatus, Probe, Repository, StateCell,
};

const PROTOCOL: &str = "sqlite";

/// Returned connections reach the idle set asynchronously; wait at most
/// this many polls for them before classifying.
const SETTLE_POLLS: usize = 25;
const SETTLE_INTERVAL: Duration = Duration::from_millis(2);

fn is_memory_dsn(dsn: &str) -> bool {
    matches!(dsn, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

pub struct SqliteAdapter {
    pool: SqlitePool,
    state: StateCell,
}

impl SqliteAdapter {
    /// Open the pool described by `config` and ping it once.
    pub async fn connect(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let dsn = config
            .dsn
            .as_deref()
            .or(config.host.as_deref())
            .ok_or_else(|| ConnectionError::Config("sqlite requires a dsn".to_string()))?;

        let max_connections = config.property_or("pool.max_connections", 5u32)?;
        let max_lifetime = config
            .property::<u64>("conn_max_lifetime_secs")?
            .map(Duration::from_secs);

        let (options, pool_options) = if is_memory_dsn(dsn) {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ConnectionError::Config(e.to_string()))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let options = SqliteConnectOptions::from_str(dsn)
                .map_err(|e| ConnectionError::Config(format!("invalid sqlite dsn '{}': {}", dsn, e)))?
                .create_if_missing(true);
            let pool_options = SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .max_lifetime(max_lifetime);
            (options, pool_options)
        };

        let pool = pool_options
            .acquire_timeout(config.timeout())
            .connect_with(options)
            .await
            .map_err(|e| ConnectionError::connect(PROTOCOL, e))?;

        let adapter = Self {
            pool,
            state: StateCell::new(ConnectionState::Connected),
        };
        adapter
            .ping()
            .await
            .map_err(|e| ConnectionError::connect(PROTOCOL, e))?;
        adapter.state.set(ConnectionState::Ready);

        tracing::info!(dsn = %dsn, "SQLite pool ready");
        Ok(adapter)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction on a pooled connection.
    pub async fn transaction(&self) -> ConnectionResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "begin", e))
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await
    }

    async fn ensure_table(&self, collection: &str) -> ConnectionResult<()> {
        validate_collection(collection)?;
        if self.pool.is_closed() {
            return Err(ConnectionError::Closed(PROTOCOL));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
            collection
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "create_table", e))?;
        Ok(())
    }

    fn classify(size: u32, idle: usize) -> (ConnectionState, &'static str) {
        match (size, idle) {
            (0, _) => (ConnectionState::Disconnected, "no open connections"),
            (_, 0) => (ConnectionState::Live, "all connections in use"),
            (size, idle) if idle as u64 <= size as u64 => (ConnectionState::Ready, "idle connections available"),
            _ => (ConnectionState::Connected, "pool statistics in flux"),
        }
    }
}

#[async_trait]
impl Connection for SqliteAdapter {
    fn behaviors(&self) -> &'static [Behavior] {
        &[Behavior::Stateful]
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Relational, Capability::Transactional, Capability::Document]
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn health_check(&self) -> HealthStatus {
        let probe = Probe::start();
        if self.pool.is_closed() {
            return probe.failed(&self.state, "pool is closed", ConnectionError::Closed(PROTOCOL));
        }
        if let Err(e) = self.ping().await {
            return probe.failed(&self.state, "ping failed", e);
        }

        let mut polls = 0;
        while self.pool.num_idle() == 0 && self.pool.size() > 0 && polls < SETTLE_POLLS {
            tokio::time::sleep(SETTLE_INTERVAL).await;
            polls += 1;
        }

        let (state, message) = Self::classify(self.pool.size(), self.pool.num_idle());
        probe.ok(&self.state, state, message)
    }

    async fn close(&self) -> ConnectionResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            tracing::debug!("SQLite pool closed");
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::new(self.pool.clone()))
    }

    fn into_repository(self: Arc<Self>) -> Option<Arc<dyn Repository>> {
        Some(self)
    }
}

#[async_trait]
impl Repository for SqliteAdapter {
    async fn get(&self, collection: &str, id: &str) -> ConnectionResult<Option<Value>> {
        self.ensure_table(collection).await?;
        let sql = format!("SELECT body FROM \"{}\" WHERE id = ?", collection);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "get", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let body: String = row
                    .try_get("body")
                    .map_err(|e| ConnectionError::operation(PROTOCOL, "get", e))?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| ConnectionError::operation(PROTOCOL, "decode", e))
            }
        }
    }

    async fn put(&self, collection: &str, id: &str, document: &Value) -> ConnectionResult<()> {
        self.ensure_table(collection).await?;
        let body = serde_json::to_string(document)
            .map_err(|e| ConnectionError::operation(PROTOCOL, "encode", e))?;
        let sql = format!(
            "INSERT INTO \"{}\" (id, body) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            collection
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "put", e))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> ConnectionResult<bool> {
        self.ensure_table(collection).await?;
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?", collection);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_ids(&self, collection: &str) -> ConnectionResult<Vec<String>> {
        self.ensure_table(collection).await?;
        let sql = format!("SELECT id FROM \"{}\" ORDER BY id", collection);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConnectionError::operation(PROTOCOL, "list_ids", e))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConnectionError::operation(PROTOCOL, "list_ids", e))
    }
}

/// Builds [`SqliteAdapter`]s for the `sqlite` protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteFactory;

#[async_trait]
impl ConnectionFactory for SqliteFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(SqliteAdapter::connect(config).await?))
    }
}
