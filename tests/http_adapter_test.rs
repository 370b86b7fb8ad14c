//! HTTP adapter health against mock backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tether::config::ConnectionConfig;
use tether::connection::ConnectionState;
use tether::registry::{extract, Registry};

mod common;

async fn registry_with_peer(addr: std::net::SocketAddr) -> Registry {
    let registry = Registry::builder().with_default_factories().build();
    registry
        .add_connection("peer", &ConnectionConfig::new("http", format!("http://{}/", addr)))
        .await
        .unwrap();
    registry
}

#[tokio::test]
async fn test_health_maps_status_to_state() {
    let cases = [
        (200, ConnectionState::Ready),
        (429, ConnectionState::Live),
        (503, ConnectionState::Connected),
        (404, ConnectionState::Connected),
        (500, ConnectionState::Error),
    ];
    for (status, expected) in cases {
        let addr = common::start_mock_backend(status).await;
        let registry = registry_with_peer(addr).await;

        let report = registry.health_check().await;
        assert_eq!(report["peer"].state, expected, "status {}", status);
        assert_eq!(registry.get("peer").await.unwrap().state(), expected);
        registry.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_head_not_allowed_falls_back_to_get() {
    let methods = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = methods.clone();
    let addr = common::start_programmable_backend(move |method| {
        seen.lock().unwrap().push(method.clone());
        async move {
            if method == "HEAD" {
                (405, String::new())
            } else {
                (200, "ok".to_string())
            }
        }
    })
    .await;

    let registry = registry_with_peer(addr).await;
    let report = registry.health_check().await;
    assert_eq!(report["peer"].state, ConnectionState::Ready);
    assert_eq!(*methods.lock().unwrap(), vec!["HEAD", "GET"]);
}

#[tokio::test]
async fn test_unreachable_peer_is_error() {
    let addr = common::closed_port().await;
    let registry = registry_with_peer(addr).await;

    let report = registry.health_check().await;
    assert_eq!(report["peer"].state, ConnectionState::Error);
    assert!(report["peer"].error.is_some());
}

#[tokio::test]
async fn test_health_probe_bypasses_breaker() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let addr = common::start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { (500, String::new()) }
    })
    .await;

    let registry = Registry::builder().with_default_factories().build();
    let config = ConnectionConfig::new("http", format!("http://{}/", addr))
        .with_property("circuit_breaker.failure_threshold", 1);
    registry.add_connection("peer", &config).await.unwrap();

    for _ in 0..3 {
        registry.health_check().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let client = extract::<reqwest::Client>(Some(&registry), "peer").await.unwrap();
    let status = client.get(format!("http://{}/", addr)).send().await.unwrap().status();
    assert_eq!(status.as_u16(), 500);
}

#[tokio::test]
async fn test_closed_peer_reports_error() {
    let addr = common::start_mock_backend(200).await;
    let registry = registry_with_peer(addr).await;
    let peer = registry.get("peer").await.unwrap();

    peer.close().await.unwrap();
    assert_eq!(peer.state(), ConnectionState::Disconnected);
    assert_eq!(peer.health_check().await.state, ConnectionState::Error);
}
