//! Event Shape Tests
//!
//! Checks the parameter layout of every `Network.webSocket*` event.

use network_domain::{CdpEvent, Direction, NetworkDomain};
use tokio::sync::broadcast;

fn collect(events: &mut broadcast::Receiver<CdpEvent>) -> Vec<CdpEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_created_event() {
    let domain = NetworkDomain::new();
    domain.handle_method("enable", None).await.unwrap();
    let mut events = domain.subscribe();

    domain
        .track_websocket("ws-1".into(), "ws://localhost:9000/chat".into())
        .unwrap();
    let events = collect(&mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].method, "Network.webSocketCreated");
    assert_eq!(events[0].params["requestId"], "ws-1");
    assert_eq!(events[0].params["url"], "ws://localhost:9000/chat");
}

#[tokio::test]
async fn test_handshake_event_lists_extensions() {
    let domain = NetworkDomain::new();
    domain.handle_method("enable", None).await.unwrap();
    domain.track_websocket("ws-1".into(), "ws://x".into()).unwrap();
    let mut events = domain.subscribe();

    domain
        .websocket_handshake("ws-1", Some("permessage-deflate"))
        .unwrap();
    let events = collect(&mut events);
    let response = &events[0].params["response"];
    assert_eq!(events[0].method, "Network.webSocketHandshakeResponseReceived");
    assert_eq!(response["status"], 101);
    assert_eq!(
        response["headers"]["Sec-WebSocket-Extensions"],
        "permessage-deflate"
    );
}

#[tokio::test]
async fn test_frame_events() {
    let domain = NetworkDomain::new();
    domain.handle_method("enable", None).await.unwrap();
    domain.track_websocket("ws-1".into(), "ws://x".into()).unwrap();
    let mut events = domain.subscribe();

    // masked "Hello" from the inspected client, RFC 6455 section 5.7
    let sent = [
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];
    domain.ingest("ws-1", Direction::Sent, &sent).await.unwrap();
    domain
        .ingest("ws-1", Direction::Received, &[0x8a, 0x00])
        .await
        .unwrap();

    let events = collect(&mut events);
    assert_eq!(events[0].method, "Network.webSocketFrameSent");
    assert_eq!(events[0].params["requestId"], "ws-1");
    assert_eq!(events[0].params["response"]["opcode"], 1);
    assert_eq!(events[0].params["response"]["mask"], true);
    assert_eq!(events[0].params["response"]["payloadData"], "Hello");
    assert!(events[0].params["timestamp"].is_f64());

    assert_eq!(events[1].method, "Network.webSocketFrameReceived");
    assert_eq!(events[1].params["response"]["opcode"], 10);
    assert_eq!(events[1].params["response"]["mask"], false);
}

#[tokio::test]
async fn test_error_and_closed_events() {
    let domain = NetworkDomain::new();
    domain.handle_method("enable", None).await.unwrap();
    domain.track_websocket("ws-1".into(), "ws://x".into()).unwrap();
    let mut events = domain.subscribe();

    // reserved opcode 0x3
    assert!(domain
        .ingest("ws-1", Direction::Received, &[0x83, 0x00])
        .await
        .is_err());
    domain.close_websocket("ws-1").unwrap();

    let events = collect(&mut events);
    assert_eq!(events[0].method, "Network.webSocketFrameError");
    assert_eq!(
        events[0].params["errorMessage"],
        "Invalid WebSocket frame: invalid opcode 3"
    );
    assert_eq!(events[1].method, "Network.webSocketClosed");
    assert_eq!(events[1].params["requestId"], "ws-1");
}
