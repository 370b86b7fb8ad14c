//! Message broker adapter over lapin (AMQP 0.9.1).
//!
//! # Responsibilities
//! - Hold one connection + channel pair, re-established when lost
//! - Declare queues with durability, TTL and length limits
//! - Publish with headers through the default exchange
//! - Consume with prefetch, auto-ack and exclusivity
//!
//! # Design Decisions
//! - Each consumption loop gets its own channel so prefetch applies per consumer
//! - Acknowledgement goes through the per-delivery acker; `ack_message` is
//!   accepted for interface parity and does nothing
//! - Consumer groups map to competing consumers on the same queue
//! - Nothing is dialed at construction; the first use or health check
//!   connects unless `eager_connect` is set
//! - Closing is final: a closed adapter never dials again

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adapters::messaging::{
    spawn_subscription, Acknowledge, ConsumerConfig, Delivery, Message, MessageQueue, NoopAck,
    QueueConfig, Subscription,
};
use crate::config::ConnectionConfig;
use crate::connection::{
    Behavior, Capability, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ConnectionState, HealthStatus, Probe, StateCell,
};

const PROTOCOL: &str = "amqp";

fn op_err(operation: &'static str) -> impl Fn(lapin::Error) -> ConnectionError {
    move |e| ConnectionError::operation(PROTOCOL, operation, e)
}

struct Link {
    connection: lapin::Connection,
    channel: Channel,
}

impl Link {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

pub struct AmqpAdapter {
    uri: String,
    connect_timeout: Duration,
    link: Mutex<Option<Link>>,
    /// Published copy of the shared channel, readable without the link lock.
    channel: ArcSwapOption<Channel>,
    closed: AtomicBool,
    state: StateCell,
}

impl AmqpAdapter {
    /// Validate the configuration. Does not touch the network.
    pub fn new(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let uri = config
            .endpoint("amqp")
            .ok_or_else(|| ConnectionError::Config("amqp requires a dsn or host".to_string()))?;
        let parsed = url::Url::parse(&uri)
            .map_err(|e| ConnectionError::Config(format!("invalid amqp url '{}': {}", uri, e)))?;
        if !matches!(parsed.scheme(), "amqp" | "amqps") {
            return Err(ConnectionError::Config(format!(
                "unsupported amqp url scheme '{}'",
                parsed.scheme()
            )));
        }
        Ok(Self {
            uri,
            connect_timeout: config.timeout(),
            link: Mutex::new(None),
            channel: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            state: StateCell::default(),
        })
    }

    async fn dial(&self) -> ConnectionResult<Link> {
        let connect = lapin::Connection::connect(&self.uri, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ConnectionError::connect(PROTOCOL, "timed out"))?
            .map_err(|e| ConnectionError::connect(PROTOCOL, e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::connect(PROTOCOL, e))?;
        Ok(Link { connection, channel })
    }

    /// The shared channel, dialing again if the link is absent or closed.
    pub async fn ensure_channel(&self) -> ConnectionResult<Channel> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(PROTOCOL));
        }
        let mut guard = self.link.lock().await;
        // close() may have taken the lock first
        if self.is_closed() {
            return Err(ConnectionError::Closed(PROTOCOL));
        }
        if let Some(link) = guard.as_ref() {
            if link.is_open() {
                return Ok(link.channel.clone());
            }
            tracing::warn!("AMQP link lost, reconnecting");
            self.channel.store(None);
            self.state.set(ConnectionState::Reconnecting);
        }

        let link = match self.dial().await {
            Ok(link) => link,
            Err(e) => {
                self.state.set(ConnectionState::Error);
                return Err(e);
            }
        };
        let channel = link.channel.clone();
        self.channel.store(Some(Arc::new(channel.clone())));
        *guard = Some(link);
        self.state.set(ConnectionState::Ready);
        tracing::info!("AMQP link established");
        Ok(channel)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A fresh channel on the shared connection.
    async fn open_channel(&self) -> ConnectionResult<Channel> {
        self.ensure_channel().await?;
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(ConnectionError::NotInitialized(PROTOCOL))?;
        link.connection.create_channel().await.map_err(op_err("create_channel"))
    }

    async fn start_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> ConnectionResult<Subscription> {
        let channel = self.open_channel().await?;
        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(op_err("qos"))?;

        let tag = if consumer_tag.is_empty() {
            format!("tether-{}", uuid::Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };
        let options = BasicConsumeOptions {
            no_ack: config.auto_ack,
            exclusive: config.exclusive,
            ..Default::default()
        };
        let mut consumer = channel
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(op_err("consume"))?;

        tracing::info!(queue = %queue, consumer = %tag, prefetch = config.prefetch, "AMQP consumer started");

        let queue = queue.to_string();
        let auto_ack = config.auto_ack;
        Ok(spawn_subscription(config.buffer, cancel, move |sink| async move {
            loop {
                let next = tokio::select! {
                    _ = sink.cancel_token().cancelled() => break,
                    next = consumer.next() => next,
                };
                match next {
                    None => break,
                    Some(Err(e)) => {
                        if !sink.error(ConnectionError::operation(PROTOCOL, "consume", e)).await {
                            break;
                        }
                    }
                    Some(Ok(delivery)) => {
                        if !sink.deliver(to_delivery(&queue, delivery, auto_ack)).await {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                tracing::debug!(consumer = %tag, error = %e, "Consumer cancel failed");
            }
            let _ = channel.close(200, "consumer stopped").await;
        }))
    }
}

fn headers_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn table_headers(table: Option<&FieldTable>) -> HashMap<String, String> {
    let Some(table) = table else { return HashMap::new() };
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                _ => return None,
            };
            Some((name.as_str().to_string(), text))
        })
        .collect()
}

fn to_delivery(queue: &str, delivery: AmqpDelivery, auto_ack: bool) -> Delivery {
    let tag = delivery.delivery_tag;
    let message = Message {
        id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| tag.to_string()),
        queue: queue.to_string(),
        headers: table_headers(delivery.properties.headers().as_ref()),
        body: delivery.data,
        receipt_handle: tag.to_string(),
    };
    if auto_ack {
        Delivery::new(message, Box::new(NoopAck))
    } else {
        Delivery::new(message, Box::new(BrokerAck(delivery.acker)))
    }
}

/// Settles one delivery by its tag on the channel it arrived on.
struct BrokerAck(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for BrokerAck {
    async fn ack(&self) -> ConnectionResult<()> {
        self.0.ack(BasicAckOptions::default()).await.map_err(op_err("ack"))
    }

    async fn nack(&self, requeue: bool) -> ConnectionResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(op_err("nack"))
    }
}

#[async_trait]
impl Connection for AmqpAdapter {
    fn behaviors(&self) -> &'static [Behavior] {
        &[Behavior::Stateful, Behavior::Streaming]
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Queue]
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn health_check(&self) -> HealthStatus {
        let probe = Probe::start();
        if self.is_closed() {
            return probe.failed(&self.state, "connection closed", ConnectionError::Closed(PROTOCOL));
        }
        let channel = match self.ensure_channel().await {
            Ok(channel) => channel,
            Err(e) => return probe.failed(&self.state, "broker unreachable", e),
        };
        if channel.status().connected() {
            probe.ok(&self.state, ConnectionState::Ready, "channel open")
        } else {
            probe.ok(&self.state, ConnectionState::Connected, "connection open, channel closing")
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::Release);
        let link = self.link.lock().await.take();
        self.channel.store(None);
        self.state.set(ConnectionState::Disconnected);
        let Some(link) = link else { return Ok(()) };

        let channel = link.channel.close(200, "closing").await;
        let connection = link.connection.close(200, "closing").await;
        tracing::debug!("AMQP link closed");
        // Closing an already closed link reports an error; that is still closed.
        match (channel, connection) {
            (_, Ok(())) => Ok(()),
            (_, Err(lapin::Error::InvalidConnectionState(_))) => Ok(()),
            (_, Err(e)) => Err(ConnectionError::operation(PROTOCOL, "close", e)),
        }
    }

    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.channel
            .load_full()
            .map(|channel| channel as Arc<dyn Any + Send + Sync>)
    }

    fn into_message_queue(self: Arc<Self>) -> Option<Arc<dyn MessageQueue>> {
        Some(self)
    }
}

#[async_trait]
impl MessageQueue for AmqpAdapter {
    async fn declare_queue(&self, config: &QueueConfig) -> ConnectionResult<()> {
        let channel = self.ensure_channel().await?;
        let mut args = FieldTable::default();
        if let Some(ttl) = config.message_ttl {
            args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl.as_millis() as i64));
        }
        if let Some(max) = config.max_length {
            args.insert("x-max-length".into(), AMQPValue::LongLongInt(max));
        }
        let options = QueueDeclareOptions {
            durable: config.durable,
            auto_delete: config.auto_delete,
            exclusive: config.exclusive,
            ..Default::default()
        };
        channel
            .queue_declare(&config.name, options, args)
            .await
            .map_err(op_err("declare_queue"))?;
        tracing::debug!(queue = %config.name, durable = config.durable, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &HashMap<String, String>) -> ConnectionResult<String> {
        let channel = self.ensure_channel().await?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut properties = BasicProperties::default().with_message_id(id.clone().into());
        if !headers.is_empty() {
            properties = properties.with_headers(headers_table(headers));
        }
        channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(op_err("publish"))?
            .await
            .map_err(op_err("publish_confirm"))?;
        Ok(id)
    }

    async fn consume(&self, queue: &str, config: &ConsumerConfig, cancel: CancellationToken) -> ConnectionResult<Subscription> {
        self.start_consumer(queue, &config.consumer_tag, config, cancel).await
    }

    async fn consume_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> ConnectionResult<Subscription> {
        tracing::debug!(queue = %queue, group = %group, "AMQP groups are competing consumers on the queue");
        self.start_consumer(queue, consumer, config, cancel).await
    }

    /// Deliveries are settled through their own acker.
    async fn ack_message(&self, queue: &str, _group: Option<&str>, receipt_handle: &str) -> ConnectionResult<()> {
        tracing::trace!(queue = %queue, receipt = %receipt_handle, "ack_message ignored for AMQP");
        Ok(())
    }
}

/// Builds [`AmqpAdapter`]s for the `amqp` protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpFactory;

#[async_trait]
impl ConnectionFactory for AmqpFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        let adapter = AmqpAdapter::new(config)?;
        if config.property_or("eager_connect", false)? {
            adapter.ensure_channel().await?;
        }
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy(uri: &str) -> AmqpAdapter {
        let mut config = ConnectionConfig::new("amqp", uri);
        config.timeout_secs = 1;
        AmqpAdapter::new(&config).unwrap()
    }

    #[test]
    fn test_header_tables() {
        let mut headers = HashMap::new();
        headers.insert("trace".to_string(), "abc".to_string());
        let table = headers_table(&headers);
        assert_eq!(table_headers(Some(&table)), headers);
        assert!(table_headers(None).is_empty());
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(AmqpAdapter::new(&ConnectionConfig::new("amqp", "redis://localhost")).is_err());
        assert!(AmqpAdapter::new(&ConnectionConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_lazy_adapter_has_no_handle() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        assert_eq!(adapter.state(), ConnectionState::NotInitialized);
        assert!(adapter.raw_connection().is_none());
        assert!(adapter.has_behavior(Behavior::Streaming));
    }

    #[tokio::test]
    async fn test_unreachable_health_is_error() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        let status = adapter.health_check().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(adapter.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_ack_message_is_a_no_op() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        adapter.ack_message("jobs", Some("workers"), "42").await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_adapter_does_not_redial() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        adapter.close().await.unwrap();
        assert!(matches!(adapter.ensure_channel().await, Err(ConnectionError::Closed(_))));
    }

    #[tokio::test]
    async fn test_health_after_close_stays_closed() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        adapter.close().await.unwrap();

        let status = adapter.health_check().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.as_deref().unwrap().contains("closed"));
        assert!(matches!(adapter.ensure_channel().await, Err(ConnectionError::Closed(_))));
        assert!(matches!(adapter.publish("jobs", b"x", &HashMap::new()).await, Err(ConnectionError::Closed(_))));
        assert!(adapter.raw_connection().is_none());
    }

    #[tokio::test]
    async fn test_handle_read_does_not_wait_for_link_lock() {
        let adapter = lazy("amqp://127.0.0.1:1/%2f");
        let _held = adapter.link.lock().await;
        // no channel has been published yet, and reading must not block
        assert!(adapter.raw_connection().is_none());
    }

    #[tokio::test]
    async fn test_factory_does_not_dial_by_default() {
        let config = ConnectionConfig::new("amqp", "amqp://127.0.0.1:1/%2f");
        let connection = AmqpFactory.create_connection(&config).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::NotInitialized);
        assert!(connection.clone().into_message_queue().is_some());

        let eager = config.with_property("eager_connect", true);
        assert!(AmqpFactory.create_connection(&eager).await.is_err());
    }
}
