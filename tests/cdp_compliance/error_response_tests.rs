//! Error Response Tests
//!
//! Network domain failures must map to JSON-RPC error objects.

use network_domain::{Direction, NetworkDomain};
use serde_json::json;

// ============================================================================
// Unknown Method Error Tests
// ============================================================================

#[tokio::test]
async fn test_unknown_method() {
    let domain = NetworkDomain::new();
    let err = domain.handle_method("unknownMethod", None).await.unwrap_err();

    // CDP error code for "Method not found" is -32601
    let cdp = err.to_cdp_error();
    assert_eq!(cdp.code, -32601);
    assert_eq!(cdp.data.unwrap()["method"], "Network.unknownMethod");
}

// ============================================================================
// Invalid Parameter Error Tests
// ============================================================================

#[tokio::test]
async fn test_get_frames_without_params() {
    let domain = NetworkDomain::new();
    let err = domain
        .handle_method("getWebSocketFrames", None)
        .await
        .unwrap_err();
    assert_eq!(err.to_cdp_error().code, -32602);
}

#[tokio::test]
async fn test_get_frames_with_wrong_type() {
    let domain = NetworkDomain::new();
    let err = domain
        .handle_method("getWebSocketFrames", Some(json!({ "requestId": 42 })))
        .await
        .unwrap_err();
    assert_eq!(err.to_cdp_error().code, -32602);
}

// ============================================================================
// Server Error Tests
// ============================================================================

#[tokio::test]
async fn test_get_frames_for_unknown_connection() {
    let domain = NetworkDomain::new();
    let err = domain
        .handle_method("getWebSocketFrames", Some(json!({ "requestId": "ws-404" })))
        .await
        .unwrap_err();
    let cdp = err.to_cdp_error();
    assert_eq!(cdp.code, -32000);
    assert_eq!(cdp.message, "WebSocket not found: ws-404");
}

#[tokio::test]
async fn test_protocol_violation_carries_close_code() {
    let domain = NetworkDomain::new();
    domain.track_websocket("ws-1".into(), "ws://x".into()).unwrap();

    // invalid UTF-8 in a text frame
    let err = domain
        .ingest("ws-1", Direction::Received, &[0x81, 0x02, 0xc3, 0x28])
        .await
        .unwrap_err();
    let cdp = err.to_cdp_error();
    assert_eq!(cdp.code, -32000);
    let data = cdp.data.unwrap();
    assert_eq!(data["code"], "WS_ERR_INVALID_UTF8");
    assert_eq!(data["closeCode"], 1007);
}
