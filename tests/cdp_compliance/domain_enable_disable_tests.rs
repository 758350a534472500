//! Domain Enable/Disable Tests

use network_domain::{Direction, NetworkDomain};
use serde_json::json;

#[tokio::test]
async fn test_enable_returns_empty_object() {
    let domain = NetworkDomain::new();
    let result = domain.handle_method("enable", None).await.unwrap();
    assert_eq!(result, json!({}));
    assert!(domain.is_enabled());
}

#[tokio::test]
async fn test_enable_accepts_buffer_params() {
    let domain = NetworkDomain::new();
    let params = json!({
        "maxTotalBufferSize": 10485760,
        "maxResourceBufferSize": 5242880
    });
    assert!(domain.handle_method("enable", Some(params)).await.is_ok());
}

#[tokio::test]
async fn test_disable_stops_events_but_keeps_recording() {
    let domain = NetworkDomain::new();
    domain.handle_method("enable", None).await.unwrap();
    let mut events = domain.subscribe();

    domain.track_websocket("ws-1".into(), "ws://x".into()).unwrap();
    assert!(events.try_recv().is_ok());

    domain.handle_method("disable", None).await.unwrap();
    domain
        .ingest("ws-1", Direction::Received, &[0x81, 0x02, b'h', b'i'])
        .await
        .unwrap();
    assert!(events.try_recv().is_err());
    assert_eq!(domain.get_websocket_frames("ws-1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_enable_disable_cycles() {
    let domain = NetworkDomain::new();
    for _ in 0..3 {
        domain.handle_method("enable", None).await.unwrap();
        assert!(domain.is_enabled());
        domain.handle_method("disable", None).await.unwrap();
        assert!(!domain.is_enabled());
    }
}
