//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Logging/metrics → Registry → Connections
//!     → Health monitor + config watcher
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop background tasks → Close registry → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then observability, then connections
//! - Fail fast: a connection that cannot be created aborts startup
//! - Shutdown has a grace period for background tasks; the registry is
//!   closed regardless

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{start, Services, StartupError};
