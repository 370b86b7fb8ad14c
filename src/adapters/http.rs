//! Outbound HTTP peer adapter.
//!
//! # Responsibilities
//! - Build a reqwest client with the configured TLS material and timeouts
//! - Route calls through a [`ResilientTransport`] built from connection properties
//! - Health: HEAD the base URL (GET on 405) and map the status to a state
//!
//! # Design Decisions
//! - Health probes use the plain client, so they never consume the retry
//!   budget or feed the circuit breaker

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, Response, StatusCode, Url};
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, TlsConfig};
use crate::connection::{
    Behavior, Capability, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ConnectionState, HealthStatus, Probe, StateCell,
};
use crate::resilience::{HttpTransport, ResilienceConfig, ResilientTransport, TransportError};

const PROTOCOL: &str = "http";

/// State implied by a health probe's status code.
pub fn classify_status(status: StatusCode) -> ConnectionState {
    match status.as_u16() {
        200..=299 => ConnectionState::Ready,
        429 => ConnectionState::Live,
        503 => ConnectionState::Connected,
        400..=499 => ConnectionState::Connected,
        500..=599 => ConnectionState::Error,
        _ => ConnectionState::Connected,
    }
}

async fn read_pem(path: &str) -> ConnectionResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ConnectionError::Config(format!("cannot read '{}': {}", path, e)))
}

async fn apply_tls(mut builder: reqwest::ClientBuilder, tls: &TlsConfig) -> ConnectionResult<reqwest::ClientBuilder> {
    if let Some(ca) = &tls.ca_path {
        let cert = Certificate::from_pem(&read_pem(ca).await?)
            .map_err(|e| ConnectionError::Config(format!("invalid CA bundle '{}': {}", ca, e)))?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
        let mut pem = read_pem(cert).await?;
        pem.push(b'\n');
        pem.extend(read_pem(key).await?);
        let identity = Identity::from_pem(&pem)
            .map_err(|e| ConnectionError::Config(format!("invalid client identity: {}", e)))?;
        builder = builder.identity(identity);
    }
    if tls.skip_verify {
        tracing::warn!("TLS certificate verification disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder)
}

pub struct HttpAdapter {
    base_url: Url,
    client: Client,
    transport: ResilientTransport<Client>,
    state: StateCell,
    closed: CancellationToken,
}

impl HttpAdapter {
    pub async fn new(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let endpoint = config
            .endpoint("http")
            .ok_or_else(|| ConnectionError::Config("http requires a dsn or host".to_string()))?;
        let base_url = Url::parse(&endpoint)
            .map_err(|e| ConnectionError::Config(format!("invalid url '{}': {}", endpoint, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConnectionError::Config(format!(
                "unsupported url scheme '{}'",
                base_url.scheme()
            )));
        }

        let resilience = ResilienceConfig::from_properties(config)?;

        let mut builder = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")));
        if let Some(tls) = &config.tls {
            builder = apply_tls(builder, tls).await?;
        }
        let client = builder.build().map_err(|e| ConnectionError::Config(e.to_string()))?;

        // The breaker guards the upstream host, which names it in logs and metrics.
        let upstream = base_url.host_str().unwrap_or(endpoint.as_str()).to_string();
        let transport = ResilientTransport::new(upstream, client.clone(), resilience);
        Ok(Self {
            base_url,
            client,
            transport,
            // Nothing is dialed until the first call.
            state: StateCell::new(ConnectionState::Connected),
            closed: CancellationToken::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn transport(&self) -> &ResilientTransport<Client> {
        &self.transport
    }

    /// Builder for `path` relative to the base URL.
    pub fn request(&self, method: Method, path: &str) -> ConnectionResult<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ConnectionError::Config(format!("invalid path '{}': {}", path, e)))?;
        Ok(self.client.request(method, url))
    }

    /// Send through the resilient transport. Cancelled when the caller's
    /// token fires or the connection is closed.
    pub async fn send(&self, request: reqwest::Request, cancel: &CancellationToken) -> Result<Response, TransportError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Cancelled),
            result = self.transport.send(request, cancel) => result,
        }
    }

    async fn probe_status(&self, method: Method) -> Result<StatusCode, reqwest::Error> {
        let response = self.client.request(method, self.base_url.clone()).send().await?;
        Ok(response.status())
    }
}

#[async_trait]
impl Connection for HttpAdapter {
    fn behaviors(&self) -> &'static [Behavior] {
        &[Behavior::Stateless]
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn health_check(&self) -> HealthStatus {
        let probe = Probe::start();
        if self.closed.is_cancelled() {
            return probe.failed(&self.state, "connection closed", ConnectionError::Closed(PROTOCOL));
        }

        let status = match self.probe_status(Method::HEAD).await {
            Ok(StatusCode::METHOD_NOT_ALLOWED) => self.probe_status(Method::GET).await,
            other => other,
        };
        match status {
            Ok(status) => {
                let state = classify_status(status);
                let message = format!("{} {}", self.base_url, status);
                if state == ConnectionState::Error {
                    probe.finish(&self.state, state, message, Some(format!("upstream answered {}", status)))
                } else {
                    probe.ok(&self.state, state, message)
                }
            }
            Err(e) => probe.failed(&self.state, "request failed", e),
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.cancel();
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn raw_connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::new(self.client.clone()))
    }
}

/// Builds [`HttpAdapter`]s for the `http` protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFactory;

#[async_trait]
impl ConnectionFactory for HttpFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn create_connection(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(HttpAdapter::new(config).await?))
    }
}
