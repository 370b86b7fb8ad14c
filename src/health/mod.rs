//! Registry-wide health checking.
//!
//! # Data Flow
//! ```text
//! Periodic timer (active.rs)
//!     → Registry::health_check (concurrent probes, per-probe timeout)
//!     → HealthReport (report.rs)
//!     → log connections that are not Ready, export metrics
//! ```
//!
//! # Design Decisions
//! - Probing lives in the adapters; this module only schedules and summarizes
//! - A report is a snapshot; state is kept in each connection's state cell

pub mod active;
pub mod report;

pub use active::HealthMonitor;
pub use report::HealthReport;
