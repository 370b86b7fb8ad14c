//! Connection contract shared by every protocol adapter.
//!
//! # Data Flow
//! ```text
//! ConnectionConfig
//!     → ConnectionFactory::create_connection (one factory per protocol)
//!     → Arc<dyn Connection> (declared behaviors/capabilities, one handle)
//!     → Registry stores it by name
//! ```
//!
//! # Design Decisions
//! - Behaviors and capabilities are declared constants, never inferred
//! - Optional surfaces (repository, message queue) are reached through
//!   explicit capability gates, not downcasting
//! - State lives in an atomic cell so reads never probe

pub mod health;
pub mod repository;
pub mod state;
pub mod types;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::adapters::messaging::MessageQueue;
use crate::config::ConnectionConfig;

pub use health::Probe;
pub use repository::Repository;
pub use state::StateCell;
pub use types::{
    Behavior, Capability, ConnectionError, ConnectionResult, ConnectionState, HealthStatus,
};

/// Opaque handle to one external system instance.
#[async_trait]
pub trait Connection: Send + Sync {
    fn behaviors(&self) -> &'static [Behavior];

    fn capabilities(&self) -> &'static [Capability];

    fn protocol(&self) -> &'static str;

    /// Last state recorded by a health check or lifecycle method.
    fn state(&self) -> ConnectionState;

    /// Probe the underlying system, update `state()` and report.
    async fn health_check(&self) -> HealthStatus;

    /// Release the underlying handle. Safe to call more than once.
    async fn close(&self) -> ConnectionResult<()>;

    /// The technology-specific handle, or `None` if there is none yet.
    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Store-operations surface, for adapters that have one.
    fn into_repository(self: Arc<Self>) -> Option<Arc<dyn Repository>> {
        None
    }

    /// Queue surface, for broker and stream adapters.
    fn into_message_queue(self: Arc<Self>) -> Option<Arc<dyn MessageQueue>> {
        None
    }

    fn has_behavior(&self, behavior: Behavior) -> bool {
        self.behaviors().contains(&behavior)
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Builds connections for exactly one protocol.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn protocol(&self) -> &'static str;

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>>;
}
