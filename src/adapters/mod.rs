//! Protocol adapters.
//!
//! # Data Flow
//! ```text
//! Registry::add_connection(name, config)
//!     → factory for config.protocol
//!         sqlite.rs  relational store (sqlx pool)
//!         redis.rs   key-value + streams (deadpool-redis)
//!         amqp.rs    message broker (lapin)
//!         http.rs    outbound peer (reqwest + resilient transport)
//!         otlp.rs    telemetry collector (opentelemetry-otlp)
//!     → Arc<dyn Connection>
//! ```
//!
//! # Design Decisions
//! - Each adapter declares its behaviors and capabilities as constants
//! - Factories validate configuration before any network I/O
//! - `messaging.rs` holds the queue surface shared by redis and amqp

pub mod amqp;
pub mod http;
pub mod messaging;
pub mod otlp;
pub mod redis;
pub mod sqlite;

use std::sync::Arc;

use crate::connection::ConnectionFactory;

pub use self::amqp::{AmqpAdapter, AmqpFactory};
pub use self::http::{HttpAdapter, HttpFactory};
pub use self::messaging::{ConsumerConfig, Delivery, Message, MessageQueue, QueueConfig, Subscription};
pub use self::otlp::{OtlpAdapter, OtlpFactory};
pub use self::redis::{RedisAdapter, RedisFactory};
pub use self::sqlite::{SqliteAdapter, SqliteFactory};

/// One factory per built-in protocol.
pub fn default_factories() -> Vec<Arc<dyn ConnectionFactory>> {
    vec![
        Arc::new(SqliteFactory),
        Arc::new(RedisFactory),
        Arc::new(AmqpFactory),
        Arc::new(HttpFactory),
        Arc::new(OtlpFactory),
    ]
}
