//! Resilient transport against real sockets.

use reqwest::{Method, StatusCode};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tether::adapters::HttpAdapter;
use tether::config::ConnectionConfig;
use tether::resilience::{CircuitState, TransportError};
use tokio_util::sync::CancellationToken;

mod common;

fn peer(addr: std::net::SocketAddr) -> ConnectionConfig {
    ConnectionConfig::new("http", format!("http://{}", addr))
        .with_property("retry_strategy.initial_interval_ms", 1)
        .with_property("retry_strategy.max_interval_ms", 5)
        .with_property("retry_strategy.multiplier", 1.0)
        .with_property("retry_strategy.random_factor", 0.0)
}

async fn call(adapter: &HttpAdapter) -> Result<reqwest::Response, TransportError> {
    let request = adapter.request(Method::GET, "/").unwrap().build().unwrap();
    adapter.send(request, &CancellationToken::new()).await
}

#[tokio::test]
async fn test_breaker_opens_before_retries_run_out() {
    let (addr, calls) = common::start_scripted_backend(vec![503]).await;
    let config = peer(addr)
        .with_property("circuit_breaker.failure_threshold", 2)
        .with_property("retry_strategy.max_attempts", 5);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let err = call(&adapter).await.unwrap_err();
    assert!(matches!(err, TransportError::CircuitOpen(_)), "got {err:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(adapter.transport().breaker().unwrap().state(), CircuitState::Open);

    // Rejected without touching the backend.
    let err = call(&adapter).await.unwrap_err();
    assert!(matches!(err, TransportError::CircuitOpen(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retries_exhausted_keeps_last_response() {
    let (addr, calls) = common::start_scripted_backend(vec![503]).await;
    let config = peer(addr)
        .with_property("circuit_breaker.failure_threshold", 5)
        .with_property("retry_strategy.max_attempts", 3);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let err = call(&adapter).await.unwrap_err();
    match &err {
        TransportError::RetriesExhausted { attempts, status, .. } => {
            assert_eq!(*attempts, 3);
            assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let last = err.into_last_response().unwrap();
    assert_eq!(last.text().await.unwrap(), "call 3");
}

#[tokio::test]
async fn test_disabled_resilience_returns_raw_server_error() {
    let (addr, calls) = common::start_scripted_backend(vec![500]).await;
    let config = peer(addr)
        .with_property("circuit_breaker.enabled", false)
        .with_property("retry_strategy.enabled", false);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let response = call(&adapter).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(adapter.transport().breaker().is_none());
}

#[tokio::test]
async fn test_recovers_within_retry_budget() {
    let (addr, calls) = common::start_scripted_backend(vec![502, 503, 200]).await;
    let config = peer(addr).with_property("retry_strategy.max_attempts", 3);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let response = call(&adapter).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(adapter.transport().breaker().unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_sub_threshold_status_is_success() {
    let (addr, calls) = common::start_scripted_backend(vec![404]).await;
    let adapter = HttpAdapter::new(&peer(addr)).await.unwrap();

    let response = call(&adapter).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_peer_fails_every_attempt() {
    let addr = common::closed_port().await;
    let config = peer(addr)
        .with_property("circuit_breaker.failure_threshold", 10)
        .with_property("retry_strategy.max_attempts", 2);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let err = call(&adapter).await.unwrap_err();
    match err {
        TransportError::AllAttemptsFailed { attempts, last_error } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last_error, TransportError::Request(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let (addr, calls) = common::start_scripted_backend(vec![503]).await;
    let config = ConnectionConfig::new("http", format!("http://{}", addr))
        .with_property("retry_strategy.initial_interval_ms", 10_000)
        .with_property("retry_strategy.max_attempts", 3);
    let adapter = HttpAdapter::new(&config).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let request = adapter.request(Method::GET, "/").unwrap().build().unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), adapter.send(request, &cancel))
        .await
        .expect("cancellation should end the backoff sleep")
        .unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
