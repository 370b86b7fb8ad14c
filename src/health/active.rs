//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered connection
//! - Log connections that are not Ready and the ones that recovered

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthMonitorConfig;
use crate::health::HealthReport;
use crate::registry::Registry;

pub struct HealthMonitor {
    registry: Arc<Registry>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, config: HealthMonitorConfig) -> Self {
        Self { registry, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Periodic health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            timeout = self.config.timeout_secs,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut degraded = HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check_all().await;
                    degraded = log_transitions(&report, degraded);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One registry-wide round.
    pub async fn check_all(&self) -> HealthReport {
        let report = HealthReport::new(self.registry.health_check().await);
        tracing::debug!(
            connections = report.connections.len(),
            healthy = report.healthy,
            "Health check round complete"
        );
        report
    }
}

/// Warn on every degraded connection, note recoveries, and return the
/// names that are degraded now.
fn log_transitions(report: &HealthReport, previously: HashSet<String>) -> HashSet<String> {
    let mut now = HashSet::new();
    for (name, status) in report.degraded() {
        tracing::warn!(
            name = %name,
            state = %status.state,
            error = status.error.as_deref().unwrap_or(""),
            message = %status.message,
            "Connection not ready"
        );
        now.insert(name.to_string());
    }
    for name in previously.difference(&now) {
        if report.connections.contains_key(name) {
            tracing::info!(name = %name, "Connection recovered");
        }
    }
    now
}
