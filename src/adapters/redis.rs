//! Key-value and stream adapter over a deadpool-redis pool.
//!
//! # Responsibilities
//! - Build the pool through one idempotent `ensure_initialized` path
//! - Point operations: get / set with TTL / remove / exists / expire
//! - Streams as queues: XADD, XREAD, XREADGROUP, XAUTOCLAIM, XACK
//! - Health: ping, then pool pressure signals
//!
//! # Design Decisions
//! - The pool is created on first use or health check (or by the factory
//!   when `eager_connect` is set); nothing else checks for a missing pool
//! - Wait timeouts are counted so health checks can report pressure
//! - Stream entries carry the body in field `body` and headers as `h:<name>`
//! - A negative acknowledgement with requeue leaves the entry pending so a
//!   later XAUTOCLAIM can hand it to another consumer

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Pool, PoolConfig, PoolError, Runtime};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::adapters::messaging::{
    spawn_subscription, Acknowledge, ConsumerConfig, Delivery, Message, MessageQueue, NoopAck,
    QueueConfig, Subscription, SubscriptionSink,
};
use crate::config::ConnectionConfig;
use crate::connection::repository::validate_collection;
use crate::connection::{
    Behavior, Capability, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ConnectionState, HealthStatus, Probe, Repository, StateCell,
};

const PROTOCOL: &str = "redis";
const BODY_FIELD: &str = "body";
const HEADER_PREFIX: &str = "h:";
const HEALTH_KEY: &str = "tether:health";
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

fn op_err(operation: &'static str) -> impl Fn(redis::RedisError) -> ConnectionError {
    move |e| ConnectionError::operation(PROTOCOL, operation, e)
}

/// Pool sizing read from connection properties.
#[derive(Debug, Clone, PartialEq)]
struct PoolSettings {
    max_size: usize,
    wait_timeout: Duration,
    connect_timeout: Duration,
}

pub struct RedisAdapter {
    url: String,
    settings: PoolSettings,
    pool: OnceCell<Pool>,
    state: StateCell,
    wait_timeouts: AtomicU64,
    closed: AtomicBool,
    queues: DashMap<String, QueueConfig>,
}

impl RedisAdapter {
    /// Validate the configuration. Does not touch the network.
    pub fn new(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let url = config
            .endpoint("redis")
            .ok_or_else(|| ConnectionError::Config("redis requires a dsn or host".to_string()))?;
        let parsed = url::Url::parse(&url)
            .map_err(|e| ConnectionError::Config(format!("invalid redis url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix") {
            return Err(ConnectionError::Config(format!(
                "unsupported redis url scheme '{}'",
                parsed.scheme()
            )));
        }

        let settings = PoolSettings {
            max_size: config.property_or("pool.max_size", 16usize)?.max(1),
            wait_timeout: config
                .duration_ms("pool.wait_timeout_ms")?
                .unwrap_or_else(|| config.timeout()),
            connect_timeout: config.timeout(),
        };

        Ok(Self {
            url,
            settings,
            pool: OnceCell::new(),
            state: StateCell::default(),
            wait_timeouts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            queues: DashMap::new(),
        })
    }

    /// The single initialization path: build the pool and ping once.
    /// Concurrent callers share one attempt; a failed attempt can be retried.
    pub async fn ensure_initialized(&self) -> ConnectionResult<&Pool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed(PROTOCOL));
        }
        self.pool
            .get_or_try_init(|| async {
                let mut cfg = deadpool_redis::Config::from_url(self.url.clone());
                let mut pool_cfg = PoolConfig::new(self.settings.max_size);
                pool_cfg.timeouts.wait = Some(self.settings.wait_timeout);
                pool_cfg.timeouts.create = Some(self.settings.connect_timeout);
                cfg.pool = Some(pool_cfg);

                let pool = cfg
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| ConnectionError::Config(e.to_string()))?;

                let mut conn = pool.get().await.map_err(|e| ConnectionError::connect(PROTOCOL, e))?;
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(|e| ConnectionError::connect(PROTOCOL, e))?;

                self.state.set(ConnectionState::Ready);
                tracing::info!(max_size = self.settings.max_size, "Redis pool initialized");
                Ok::<_, ConnectionError>(pool)
            })
            .await
    }

    async fn conn(&self) -> ConnectionResult<deadpool_redis::Connection> {
        let pool = self.ensure_initialized().await?;
        pool.get().await.map_err(|e| {
            if matches!(e, PoolError::Timeout(_)) {
                self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionError::operation(PROTOCOL, "acquire", e)
        })
    }

    pub async fn get(&self, key: &str) -> ConnectionResult<Option<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(op_err("get"))
    }

    /// Store a value, expiring after `ttl` when given.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ConnectionResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(op_err("set"))
    }

    pub async fn remove(&self, key: &str) -> ConnectionResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(op_err("remove"))?;
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> ConnectionResult<bool> {
        let mut conn = self.conn().await?;
        let n: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await.map_err(op_err("exists"))?;
        Ok(n > 0)
    }

    /// Returns false when the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> ConnectionResult<bool> {
        let mut conn = self.conn().await?;
        let set: u64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(op_err("expire"))?;
        Ok(set == 1)
    }

    /// Take over entries of `group` idle for at least `min_idle`.
    pub async fn claim_pending(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> ConnectionResult<Vec<Delivery>> {
        let pool = self.ensure_initialized().await?.clone();
        let mut conn = self.conn().await?;
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(op_err("claim_pending"))?;

        if !reply.claimed.is_empty() {
            tracing::debug!(queue = %queue, group = %group, claimed = reply.claimed.len(), "Claimed pending stream entries");
        }
        Ok(reply
            .claimed
            .iter()
            .map(|entry| stream_delivery(&pool, queue, Some(group), entry, false))
            .collect())
    }

    async fn ensure_group(&self, queue: &str, group: &str) -> ConnectionResult<()> {
        let mut conn = self.conn().await?;
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match created {
            Ok(()) => {
                tracing::debug!(queue = %queue, group = %group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(ConnectionError::operation(PROTOCOL, "create_group", e)),
        }
    }

    fn record_key(collection: &str, id: &str) -> String {
        format!("{}:{}", collection, id)
    }
}

/// Turn one stream entry into a message.
fn stream_message(queue: &str, entry: &StreamId) -> Message {
    let mut headers = HashMap::new();
    let mut body = Vec::new();
    for (field, value) in &entry.map {
        if field == BODY_FIELD {
            body = redis::from_redis_value::<Vec<u8>>(value).unwrap_or_default();
        } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
            if let Ok(text) = redis::from_redis_value::<String>(value) {
                headers.insert(name.to_string(), text);
            }
        }
    }
    Message {
        id: entry.id.clone(),
        queue: queue.to_string(),
        headers,
        body,
        receipt_handle: entry.id.clone(),
    }
}

fn stream_delivery(pool: &Pool, queue: &str, group: Option<&str>, entry: &StreamId, auto_ack: bool) -> Delivery {
    let message = stream_message(queue, entry);
    match group {
        Some(group) if !auto_ack => {
            let acker = StreamAck {
                pool: pool.clone(),
                queue: queue.to_string(),
                group: group.to_string(),
                id: entry.id.clone(),
            };
            Delivery::new(message, Box::new(acker))
        }
        _ => Delivery::new(message, Box::new(NoopAck)),
    }
}

async fn xack(pool: &Pool, queue: &str, group: &str, id: &str) -> ConnectionResult<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| ConnectionError::operation(PROTOCOL, "acquire", e))?;
    redis::cmd("XACK")
        .arg(queue)
        .arg(group)
        .arg(id)
        .query_async::<u64>(&mut conn)
        .await
        .map_err(op_err("ack"))?;
    Ok(())
}

/// Acknowledges one entry of a consumer group.
struct StreamAck {
    pool: Pool,
    queue: String,
    group: String,
    id: String,
}

#[async_trait]
impl Acknowledge for StreamAck {
    async fn ack(&self) -> ConnectionResult<()> {
        xack(&self.pool, &self.queue, &self.group, &self.id).await
    }

    async fn nack(&self, requeue: bool) -> ConnectionResult<()> {
        if requeue {
            // Stays in the pending list until claimed.
            Ok(())
        } else {
            xack(&self.pool, &self.queue, &self.group, &self.id).await
        }
    }
}

/// Where a read loop reads from.
#[derive(Clone)]
enum ReadMode {
    Plain,
    Group { group: String, consumer: String },
}

/// Report `err`, then wait before the next attempt. False when the
/// subscription is finished.
async fn report_and_pause(sink: &SubscriptionSink, err: ConnectionError) -> bool {
    if !sink.error(err).await {
        return false;
    }
    tokio::select! {
        _ = sink.cancel_token().cancelled() => false,
        _ = tokio::time::sleep(READ_RETRY_DELAY) => true,
    }
}

async fn read_loop(pool: Pool, queue: String, mode: ReadMode, config: ConsumerConfig, sink: SubscriptionSink) {
    let block_ms = config.block_timeout.as_millis().max(1) as u64;
    let count = config.prefetch.max(1);
    let mut last_id = "$".to_string();

    loop {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                if report_and_pause(&sink, ConnectionError::operation(PROTOCOL, "acquire", e)).await {
                    continue;
                }
                return;
            }
        };

        let mut cmd = match &mode {
            ReadMode::Plain => redis::cmd("XREAD"),
            ReadMode::Group { group, consumer } => {
                let mut c = redis::cmd("XREADGROUP");
                c.arg("GROUP").arg(group).arg(consumer);
                c
            }
        };
        cmd.arg("COUNT").arg(count).arg("BLOCK").arg(block_ms);
        if config.auto_ack && matches!(mode, ReadMode::Group { .. }) {
            cmd.arg("NOACK");
        }
        let cursor = match &mode {
            ReadMode::Plain => last_id.as_str(),
            ReadMode::Group { .. } => ">",
        };
        cmd.arg("STREAMS").arg(&queue).arg(cursor);

        let result: redis::RedisResult<Option<StreamReadReply>> = tokio::select! {
            _ = sink.cancel_token().cancelled() => return,
            reply = cmd.query_async(&mut conn) => reply,
        };
        drop(conn);
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if report_and_pause(&sink, ConnectionError::operation(PROTOCOL, "read", e)).await {
                    continue;
                }
                return;
            }
        };

        let Some(reply) = reply else { continue };
        for entry in reply.keys.iter().flat_map(|k| k.ids.iter()) {
            last_id = entry.id.clone();
            let group = match &mode {
                ReadMode::Plain => None,
                ReadMode::Group { group, .. } => Some(group.as_str()),
            };
            if !sink.deliver(stream_delivery(&pool, &queue, group, entry, config.auto_ack)).await {
                return;
            }
        }
    }
}

#[async_trait]
impl Connection for RedisAdapter {
    fn behaviors(&self) -> &'static [Behavior] {
        &[Behavior::Stateful, Behavior::Streaming]
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::KeyValue, Capability::Cache, Capability::Queue]
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn health_check(&self) -> HealthStatus {
        let probe = Probe::start();
        let pool = match self.ensure_initialized().await {
            Ok(pool) => pool,
            Err(e) => return probe.failed(&self.state, "pool unavailable", e),
        };

        let ping = match self.conn().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = ping {
            return probe.failed(&self.state, "ping failed", e);
        }

        let timeouts = self.wait_timeouts.swap(0, Ordering::Relaxed);
        if timeouts > 0 {
            return probe.finish(
                &self.state,
                ConnectionState::Live,
                "pool under pressure",
                Some(format!("{} pool wait timeouts since last check", timeouts)),
            );
        }

        if let Err(e) = self.exists(HEALTH_KEY).await {
            return probe.finish(&self.state, ConnectionState::Live, "exploratory command failed", Some(e.to_string()));
        }

        let status = pool.status();
        if status.size >= status.max_size && status.available == 0 {
            return probe.ok(&self.state, ConnectionState::Live, "pool at capacity");
        }
        probe.ok(&self.state, ConnectionState::Ready, "pong")
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(pool) = self.pool.get() {
            pool.close();
            tracing::debug!("Redis pool closed");
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.pool
            .get()
            .map(|pool| Arc::new(pool.clone()) as Arc<dyn Any + Send + Sync>)
    }

    fn into_repository(self: Arc<Self>) -> Option<Arc<dyn Repository>> {
        Some(self)
    }

    fn into_message_queue(self: Arc<Self>) -> Option<Arc<dyn MessageQueue>> {
        Some(self)
    }
}

#[async_trait]
impl Repository for RedisAdapter {
    async fn get(&self, collection: &str, id: &str) -> ConnectionResult<Option<Value>> {
        validate_collection(collection)?;
        match RedisAdapter::get(self, &Self::record_key(collection, id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ConnectionError::operation(PROTOCOL, "decode", e)),
        }
    }

    async fn put(&self, collection: &str, id: &str, document: &Value) -> ConnectionResult<()> {
        validate_collection(collection)?;
        let raw = serde_json::to_string(document).map_err(|e| ConnectionError::operation(PROTOCOL, "encode", e))?;
        self.set(&Self::record_key(collection, id), &raw, None).await
    }

    async fn delete(&self, collection: &str, id: &str) -> ConnectionResult<bool> {
        validate_collection(collection)?;
        self.remove(&Self::record_key(collection, id)).await
    }

    async fn list_ids(&self, collection: &str) -> ConnectionResult<Vec<String>> {
        validate_collection(collection)?;
        let prefix = format!("{}:", collection);
        let pattern = format!("{}*", prefix);
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(op_err("list_ids"))?;
            ids.extend(keys.into_iter().filter_map(|k| k.strip_prefix(&prefix).map(str::to_string)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl MessageQueue for RedisAdapter {
    /// Streams need no declaration; the settings are kept for publish.
    async fn declare_queue(&self, config: &QueueConfig) -> ConnectionResult<()> {
        if config.name.is_empty() {
            return Err(ConnectionError::Config("queue name must not be empty".to_string()));
        }
        self.queues.insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &HashMap<String, String>) -> ConnectionResult<String> {
        let max_length = self.queues.get(queue).and_then(|q| q.max_length);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue);
        if let Some(max) = max_length {
            cmd.arg("MAXLEN").arg("~").arg(max);
        }
        cmd.arg("*").arg(BODY_FIELD).arg(body);
        for (name, value) in headers {
            cmd.arg(format!("{}{}", HEADER_PREFIX, name)).arg(value);
        }

        let mut conn = self.conn().await?;
        cmd.query_async(&mut conn).await.map_err(op_err("publish"))
    }

    async fn consume(&self, queue: &str, config: &ConsumerConfig, cancel: CancellationToken) -> ConnectionResult<Subscription> {
        let pool = self.ensure_initialized().await?.clone();
        let queue = queue.to_string();
        let config = config.clone();
        Ok(spawn_subscription(config.buffer, cancel, move |sink| {
            read_loop(pool, queue, ReadMode::Plain, config, sink)
        }))
    }

    async fn consume_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> ConnectionResult<Subscription> {
        self.ensure_group(queue, group).await?;
        let pool = self.ensure_initialized().await?.clone();
        let mode = ReadMode::Group {
            group: group.to_string(),
            consumer: consumer.to_string(),
        };
        let queue = queue.to_string();
        let config = config.clone();
        Ok(spawn_subscription(config.buffer, cancel, move |sink| {
            read_loop(pool, queue, mode, config, sink)
        }))
    }

    async fn ack_message(&self, queue: &str, group: Option<&str>, receipt_handle: &str) -> ConnectionResult<()> {
        let group = group.ok_or_else(|| {
            ConnectionError::Config("stream acknowledgement requires a consumer group".to_string())
        })?;
        let pool = self.ensure_initialized().await?;
        xack(pool, queue, group, receipt_handle).await
    }
}

/// Builds [`RedisAdapter`]s for the `redis` protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisFactory;

#[async_trait]
impl ConnectionFactory for RedisFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        let adapter = RedisAdapter::new(config)?;
        if config.property_or("eager_connect", false)? {
            adapter.ensure_initialized().await?;
        }
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value as RedisValue;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let argc: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            args.push(line.trim_end().to_string());
        }
        Some(args)
    }

    /// A RESP server that answers PING and setup commands but fails every
    /// stream read. Returns the address and the number of reads seen.
    async fn start_failing_stream_server() -> (SocketAddr, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let counter = counter.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    while let Some(args) = read_command(&mut reader).await {
                        let name = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
                        let reply = match name.as_str() {
                            "PING" if args.len() > 1 => format!("${}\r\n{}\r\n", args[1].len(), args[1]),
                            "PING" => "+PONG\r\n".to_string(),
                            "XREAD" | "XREADGROUP" => {
                                counter.fetch_add(1, Ordering::SeqCst);
                                "-ERR stream unavailable\r\n".to_string()
                            }
                            _ => "+OK\r\n".to_string(),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, reads)
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), RedisValue::BulkString(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn test_stream_entry_to_message() {
        let msg = stream_message("jobs", &entry("1-0", &[("body", "hello"), ("h:trace", "abc"), ("other", "x")]));
        assert_eq!(msg.id, "1-0");
        assert_eq!(msg.receipt_handle, "1-0");
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.headers.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(msg.headers.len(), 1);
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(RedisAdapter::new(&ConnectionConfig::new("redis", "http://localhost")).is_err());
        assert!(RedisAdapter::new(&ConnectionConfig::new("redis", "not a url")).is_err());
        assert!(RedisAdapter::new(&ConnectionConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_lazy_adapter_has_no_handle() {
        let config = ConnectionConfig::new("redis", "redis://127.0.0.1:1");
        let conn = RedisFactory.create_connection(&config).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::NotInitialized);
        assert!(conn.raw_connection().is_none());
        assert!(conn.has_capability(Capability::Queue));
    }

    #[tokio::test]
    async fn test_eager_factory_fails_on_unreachable_server() {
        let mut config = ConnectionConfig::new("redis", "redis://127.0.0.1:1").with_property("eager_connect", true);
        config.timeout_secs = 1;
        assert!(RedisFactory.create_connection(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_health_is_error() {
        let mut config = ConnectionConfig::new("redis", "redis://127.0.0.1:1");
        config.timeout_secs = 1;
        let adapter = RedisAdapter::new(&config).unwrap();
        let status = adapter.health_check().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_closed_adapter_refuses_work() {
        let adapter = RedisAdapter::new(&ConnectionConfig::new("redis", "redis://127.0.0.1:1")).unwrap();
        adapter.close().await.unwrap();
        assert!(matches!(adapter.get("k").await, Err(ConnectionError::Closed(_))));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ack_requires_group() {
        let adapter = RedisAdapter::new(&ConnectionConfig::new("redis", "redis://127.0.0.1:1")).unwrap();
        let err = adapter.ack_message("jobs", None, "1-0").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Config(_)));
    }

    #[tokio::test]
    async fn test_failing_reads_back_off() {
        let (addr, reads) = start_failing_stream_server().await;
        let adapter = RedisAdapter::new(&ConnectionConfig::new("redis", format!("redis://{}", addr))).unwrap();
        let cancel = CancellationToken::new();
        let mut subscription = adapter
            .consume("jobs", &ConsumerConfig::default(), cancel.clone())
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), subscription.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, ConnectionError::Operation { operation: "read", .. }));

        let drain = async { while subscription.errors.recv().await.is_some() {} };
        let _ = tokio::time::timeout(Duration::from_millis(1200), drain).await;
        cancel.cancel();

        let seen = reads.load(Ordering::SeqCst);
        assert!(seen >= 2, "reads should be retried, saw {}", seen);
        assert!(seen <= 5, "reads should pause between failures, saw {}", seen);
        adapter.close().await.unwrap();
    }
}
