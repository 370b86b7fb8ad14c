//! Queue surface shared by broker and stream adapters.
//!
//! # Data Flow
//! ```text
//! MessageQueue::consume(queue, cfg, cancel)
//!     → adapter spawns a loop
//!     → each delivery: Message (plain data) + acker bound to that delivery
//!     → select!(cancel, messages.send(delivery))
//!     → loop ends → both channels close together
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionError, ConnectionResult};

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Upper bound on queued messages; older ones are dropped first.
    pub max_length: Option<i64>,
    pub message_ttl: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            max_length: None,
            message_ttl: None,
        }
    }
}

/// Consumption settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Deliveries in flight before acknowledgement (broker prefetch, stream batch size).
    pub prefetch: u16,
    /// How long one stream read blocks before looping.
    pub block_timeout: Duration,
    pub auto_ack: bool,
    pub exclusive: bool,
    /// Consumer tag sent to the broker; generated when empty.
    pub consumer_tag: String,
    /// Capacity of the outgoing channel.
    pub buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            block_timeout: Duration::from_secs(5),
            auto_ack: false,
            exclusive: false,
            consumer_tag: String::new(),
            buffer: 64,
        }
    }
}

/// One received message. Plain data; acknowledgement lives on [`Delivery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub queue: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Broker delivery tag or stream entry id, usable with `ack_message`.
    pub receipt_handle: String,
}

/// Acknowledgement bound to exactly one delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> ConnectionResult<()>;

    async fn nack(&self, requeue: bool) -> ConnectionResult<()>;
}

/// Acker for deliveries the broker already considers settled (auto-ack).
pub struct NoopAck;

#[async_trait]
impl Acknowledge for NoopAck {
    async fn ack(&self) -> ConnectionResult<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> ConnectionResult<()> {
        Ok(())
    }
}

/// A message plus the means to settle it. Settling consumes the delivery.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> ConnectionResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> ConnectionResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("message", &self.message).finish_non_exhaustive()
    }
}

/// Parallel message and error streams of one consumption loop.
#[derive(Debug)]
pub struct Subscription {
    pub messages: mpsc::Receiver<Delivery>,
    pub errors: mpsc::Receiver<ConnectionError>,
}

/// Sending half handed to an adapter's consumption loop.
#[derive(Debug, Clone)]
pub struct SubscriptionSink {
    messages: mpsc::Sender<Delivery>,
    errors: mpsc::Sender<ConnectionError>,
    cancel: CancellationToken,
}

impl SubscriptionSink {
    /// Hand one delivery downstream. False once cancelled or the receiver is gone.
    pub async fn deliver(&self, delivery: Delivery) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.messages.send(delivery) => sent.is_ok(),
        }
    }

    /// Report a non-fatal error. False once cancelled or the receiver is gone.
    pub async fn error(&self, err: ConnectionError) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.errors.send(err) => sent.is_ok(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Spawn `run` as the consumption loop. The loop owns the only senders,
/// so both receivers close when it returns.
pub fn spawn_subscription<F, Fut>(buffer: usize, cancel: CancellationToken, run: F) -> Subscription
where
    F: FnOnce(SubscriptionSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (msg_tx, msg_rx) = mpsc::channel(buffer.max(1));
    let (err_tx, err_rx) = mpsc::channel(buffer.max(1));
    let sink = SubscriptionSink {
        messages: msg_tx,
        errors: err_tx,
        cancel,
    };
    tokio::spawn(run(sink));
    Subscription {
        messages: msg_rx,
        errors: err_rx,
    }
}

/// Declare, publish, consume and acknowledge.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn declare_queue(&self, config: &QueueConfig) -> ConnectionResult<()>;

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> ConnectionResult<String>;

    /// Plain consumption: every consumer sees the queue on its own terms.
    async fn consume(
        &self,
        queue: &str,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> ConnectionResult<Subscription>;

    /// Consumer-group consumption: members of `group` share the work.
    async fn consume_group(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> ConnectionResult<Subscription>;

    /// Acknowledge by receipt handle, outside of a [`Delivery`].
    async fn ack_message(&self, queue: &str, group: Option<&str>, receipt_handle: &str) -> ConnectionResult<()>;
}
