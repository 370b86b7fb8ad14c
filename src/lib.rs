//! Connection registry with resilient transport and protocol adapters.

pub mod adapters;
pub mod config;
pub mod connection;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use config::{ConnectionConfig, RegistryConfig};
pub use connection::{Connection, ConnectionFactory, ConnectionState, HealthStatus};
pub use lifecycle::Shutdown;
pub use registry::{extract, Registry, RegistryError};
