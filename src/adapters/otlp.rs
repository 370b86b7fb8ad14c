//! Telemetry export adapter (OTLP over gRPC).
//!
//! # Responsibilities
//! - Build span, metric and log exporters against one collector endpoint
//! - Hand the exporters out once, plus a `Resource` describing the service
//! - Shut every exporter still held down on close
//!
//! # Design Decisions
//! - Health builds and drops a throwaway span exporter; the live exporters
//!   are never touched by a probe
//! - Exporters are taken, not borrowed: whoever builds the providers owns them

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::logs::LogExporter as _;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter as _;
use opentelemetry_sdk::trace::SpanExporter as _;
use opentelemetry_sdk::Resource;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::{
    Behavior, Capability, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ConnectionState, HealthStatus, Probe, StateCell,
};

const PROTOCOL: &str = "otlp";

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Service identity attached to every signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceIdentity {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl ServiceIdentity {
    fn from_properties(config: &ConnectionConfig) -> ConnectionResult<Self> {
        Ok(Self {
            name: config.property_or("service_name", "tether".to_string())?,
            version: config.property_or("service_version", env!("CARGO_PKG_VERSION").to_string())?,
            environment: config.property_or("environment", "development".to_string())?,
        })
    }
}

pub struct OtlpAdapter {
    endpoint: String,
    timeout: Duration,
    identity: ServiceIdentity,
    spans: Mutex<Option<SpanExporter>>,
    metrics: Mutex<Option<MetricExporter>>,
    logs: Mutex<Option<LogExporter>>,
    closed: AtomicBool,
    state: StateCell,
}

impl OtlpAdapter {
    pub fn new(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let endpoint = config
            .endpoint("http")
            .ok_or_else(|| ConnectionError::Config("otlp requires a dsn or host".to_string()))?;
        let parsed = url::Url::parse(&endpoint)
            .map_err(|e| ConnectionError::Config(format!("invalid otlp endpoint '{}': {}", endpoint, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConnectionError::Config(format!(
                "unsupported otlp endpoint scheme '{}'",
                parsed.scheme()
            )));
        }

        let identity = ServiceIdentity::from_properties(config)?;
        let timeout = config.timeout();

        let spans = build_span_exporter(&endpoint, timeout)?;
        let metrics = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::connect(PROTOCOL, format!("metric exporter: {}", e)))?;
        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::connect(PROTOCOL, format!("log exporter: {}", e)))?;

        tracing::info!(endpoint = %endpoint, service = %identity.name, "OTLP exporters built");
        Ok(Self {
            endpoint,
            timeout,
            identity,
            spans: Mutex::new(Some(spans)),
            metrics: Mutex::new(Some(metrics)),
            logs: Mutex::new(Some(logs)),
            closed: AtomicBool::new(false),
            state: StateCell::new(ConnectionState::Ready),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// service.name, service.version and deployment.environment.
    pub fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.identity.name.clone())
            .with_attributes([
                KeyValue::new("service.version", self.identity.version.clone()),
                KeyValue::new("deployment.environment", self.identity.environment.clone()),
            ])
            .build()
    }

    pub fn take_span_exporter(&self) -> Option<SpanExporter> {
        take(&self.spans)
    }

    pub fn take_metric_exporter(&self) -> Option<MetricExporter> {
        take(&self.metrics)
    }

    pub fn take_log_exporter(&self) -> Option<LogExporter> {
        take(&self.logs)
    }
}

fn build_span_exporter(endpoint: &str, timeout: Duration) -> ConnectionResult<SpanExporter> {
    SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .with_timeout(timeout)
        .build()
        .map_err(|e| ConnectionError::connect(PROTOCOL, format!("span exporter: {}", e)))
}

#[async_trait]
impl Connection for OtlpAdapter {
    fn behaviors(&self) -> &'static [Behavior] {
        &[Behavior::Stateless]
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Observability,
            Capability::Logging,
            Capability::Metrics,
            Capability::Tracing,
        ]
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn health_check(&self) -> HealthStatus {
        let probe = Probe::start();
        if self.closed.load(Ordering::Acquire) {
            return probe.failed(&self.state, "exporters shut down", ConnectionError::Closed(PROTOCOL));
        }
        match build_span_exporter(&self.endpoint, self.timeout) {
            Ok(exporter) => {
                drop(exporter);
                probe.ok(&self.state, ConnectionState::Ready, format!("exporter config valid for {}", self.endpoint))
            }
            Err(e) => probe.failed(&self.state, "exporter build failed", e),
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::Release);
        let mut failures = Vec::new();
        if let Some(mut exporter) = take(&self.spans) {
            if let Err(e) = exporter.shutdown() {
                failures.push(format!("trace: {}", e));
            }
        }
        if let Some(mut exporter) = take(&self.metrics) {
            if let Err(e) = exporter.shutdown() {
                failures.push(format!("metric: {}", e));
            }
        }
        if let Some(mut exporter) = take(&self.logs) {
            if let Err(e) = exporter.shutdown() {
                failures.push(format!("log: {}", e));
            }
        }
        self.state.set(ConnectionState::Disconnected);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::operation(PROTOCOL, "close", failures.join("; ")))
        }
    }

    /// The resource every signal is tagged with; the exporters themselves
    /// are handed out through the `take_*` methods.
    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::new(self.resource()))
    }
}

/// Builds [`OtlpAdapter`]s for the `otlp` protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct OtlpFactory;

#[async_trait]
impl ConnectionFactory for OtlpFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(OtlpAdapter::new(config)?))
    }
}
