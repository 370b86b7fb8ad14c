//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RegistryConfig (validated, immutable)
//!     → Registry::load_from_config
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Registry::reconcile adds/removes/replaces connections
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes go through a full reload
//! - All sections have defaults to allow minimal configs
//! - Adapter-specific knobs live in a free-form `properties` map

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ConnectionConfig, HealthMonitorConfig, ObservabilityConfig, RegistryConfig, TlsConfig,
};
