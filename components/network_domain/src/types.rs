//! CDP-facing records for inspected WebSocket traffic

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use ws_engine::ReceiverEvent;

/// Seconds since the epoch, as CDP timestamps are expressed
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Which way inspected bytes were travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the inspected process to the remote server (masked frames)
    Sent,
    /// From the remote server to the inspected process
    Received,
}

/// WebSocket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketState {
    /// Upgrade request seen, no response yet
    Connecting,
    /// Handshake completed
    Open,
    /// A close frame was seen in at least one direction
    Closing,
    /// Connection is closed
    Closed,
}

/// One decoded frame as reported to devtools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFrame {
    /// RFC 6455 opcode of the message
    pub opcode: u8,
    /// Whether the frame was masked on the wire
    pub mask: bool,
    /// Text payload, or base64 for everything else
    pub payload_data: String,
    /// Whether `payload_data` is base64
    pub is_base64: bool,
    /// Capture time in seconds since the epoch
    pub timestamp: f64,
    /// Direction of travel
    pub direction: Direction,
}

impl WebSocketFrame {
    /// Build a frame record from a decoded receiver event
    pub fn from_event(event: ReceiverEvent, direction: Direction) -> Self {
        let (opcode, payload_data, is_base64) = match event {
            ReceiverEvent::Message {
                data,
                is_binary: false,
            } => {
                let text = data.into_bytes();
                (1, String::from_utf8_lossy(&text).into_owned(), false)
            }
            ReceiverEvent::Message {
                data,
                is_binary: true,
            } => (2, BASE64.encode(data.into_bytes()), true),
            ReceiverEvent::Conclude { code, reason } => {
                let mut payload = Vec::with_capacity(reason.len() + 2);
                if code != ws_engine::receiver::NO_STATUS_RECEIVED {
                    payload.extend_from_slice(&code.to_be_bytes());
                    payload.extend_from_slice(&reason);
                }
                (8, BASE64.encode(payload), true)
            }
            ReceiverEvent::Ping(payload) => (9, BASE64.encode(&payload), true),
            ReceiverEvent::Pong(payload) => (10, BASE64.encode(&payload), true),
        };

        Self {
            opcode,
            mask: direction == Direction::Sent,
            payload_data,
            is_base64,
            timestamp: timestamp(),
            direction,
        }
    }

    /// Decode the payload back into bytes
    pub fn payload_bytes(&self) -> Bytes {
        if self.is_base64 {
            BASE64
                .decode(&self.payload_data)
                .map(Bytes::from)
                .unwrap_or_default()
        } else {
            Bytes::copy_from_slice(self.payload_data.as_bytes())
        }
    }

    /// The `response` object of a CDP frame event
    pub fn to_cdp(&self) -> Value {
        serde_json::json!({
            "opcode": self.opcode,
            "mask": self.mask,
            "payloadData": self.payload_data,
        })
    }
}

/// Tracked WebSocket connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketConnection {
    /// Request id the connection is known by
    pub request_id: String,
    /// WebSocket URL
    pub url: String,
    /// Connection state
    pub state: WebSocketState,
    /// Negotiated `Sec-WebSocket-Extensions` response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<String>,
    /// Creation time in seconds since the epoch
    pub timestamp: f64,
    /// Most recent frames in both directions
    #[serde(default)]
    pub frames: VecDeque<WebSocketFrame>,
}

impl WebSocketConnection {
    /// Create a connection in the connecting state
    pub fn new(request_id: String, url: String) -> Self {
        Self {
            request_id,
            url,
            state: WebSocketState::Connecting,
            extensions: None,
            timestamp: timestamp(),
            frames: VecDeque::new(),
        }
    }

    /// Record a frame, dropping the oldest beyond `limit`
    pub fn add_frame(&mut self, frame: WebSocketFrame, limit: usize) {
        self.frames.push_back(frame);
        while self.frames.len() > limit {
            self.frames.pop_front();
        }
    }
}

/// A CDP event ready to be sent to a devtools client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpEvent {
    /// Fully qualified method, e.g. `Network.webSocketCreated`
    pub method: String,
    /// Event parameters
    pub params: Value,
}

impl CdpEvent {
    pub(crate) fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}
