//! Network domain errors and their CDP wire form

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use ws_engine::{NegotiationError, ProtocolError};

/// Errors raised by the Network domain
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// A method was called with missing or malformed parameters
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// No method with this name exists in the domain
    #[error("Method not found: Network.{0}")]
    MethodNotFound(String),

    /// No WebSocket is tracked under this request id
    #[error("WebSocket not found: {0}")]
    ConnectionNotFound(String),

    /// A WebSocket is already tracked under this request id
    #[error("WebSocket already tracked: {0}")]
    DuplicateConnection(String),

    /// The handshake response carried an unusable extension header
    #[error("Extension negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The inspected stream broke the WebSocket protocol
    #[error("WebSocket {request_id} protocol error: {source}")]
    Protocol {
        /// Connection that failed
        request_id: String,
        /// Decoder error
        #[source]
        source: ProtocolError,
    },
}

impl NetworkError {
    /// JSON-RPC error code for this error
    pub fn code(&self) -> i32 {
        match self {
            NetworkError::InvalidParams(_) => -32602,
            NetworkError::MethodNotFound(_) => -32601,
            _ => -32000,
        }
    }

    /// Convert into the error object sent back to a devtools client
    pub fn to_cdp_error(&self) -> CdpError {
        let data = match self {
            NetworkError::InvalidParams(details) => Some(json!({ "details": details })),
            NetworkError::MethodNotFound(method) => {
                Some(json!({ "method": format!("Network.{}", method) }))
            }
            NetworkError::Protocol { source, .. } => Some(json!({
                "code": source.code(),
                "closeCode": source.close_code(),
            })),
            _ => None,
        };
        CdpError {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

/// JSON-RPC style error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpError {
    /// Error code
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Result type for Network domain operations
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(NetworkError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(NetworkError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(NetworkError::ConnectionNotFound("x".into()).code(), -32000);
    }

    #[test]
    fn test_cdp_error_serialization() {
        let err = NetworkError::MethodNotFound("frobnicate".to_string()).to_cdp_error();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], -32601);
        assert_eq!(value["data"]["method"], "Network.frobnicate");

        let err = NetworkError::ConnectionNotFound("ws-1".to_string()).to_cdp_error();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["message"], "WebSocket not found: ws-1");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_protocol_error_data() {
        let err = NetworkError::Protocol {
            request_id: "ws-1".to_string(),
            source: ProtocolError::InvalidUtf8,
        };
        let cdp = err.to_cdp_error();
        assert_eq!(cdp.code, -32000);
        let data = cdp.data.unwrap();
        assert_eq!(data["code"], "WS_ERR_INVALID_UTF8");
        assert_eq!(data["closeCode"], 1007);
    }
}
