//! Aggregate view over one round of health checks.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::connection::{ConnectionState, HealthStatus};

/// One registry-wide health check, keyed by connection name.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// True when every connection reported Ready.
    pub healthy: bool,
    pub connections: BTreeMap<String, HealthStatus>,
}

impl HealthReport {
    pub fn new(statuses: HashMap<String, HealthStatus>) -> Self {
        let connections: BTreeMap<_, _> = statuses.into_iter().collect();
        let healthy = connections.values().all(|s| s.state == ConnectionState::Ready);
        Self { healthy, connections }
    }

    /// Names and statuses of connections that are not Ready, sorted by name.
    pub fn degraded(&self) -> impl Iterator<Item = (&str, &HealthStatus)> {
        self.connections
            .iter()
            .filter(|(_, s)| s.state != ConnectionState::Ready)
            .map(|(name, s)| (name.as_str(), s))
    }

    pub fn count(&self, state: ConnectionState) -> usize {
        self.connections.values().filter(|s| s.state == state).count()
    }
}
