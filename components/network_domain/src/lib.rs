//! Network domain: WebSocket inspection
//!
//! This crate implements the WebSocket part of the Chrome DevTools Protocol
//! (CDP) Network domain. Raw bytes observed on an inspected connection are
//! decoded with [`ws_engine`] and republished as `Network.webSocket*` events.
//!
//! # Features
//! - **Connection tracking**: creation, handshake, close and removal
//! - **Frame decoding**: one decoder per direction, permessage-deflate aware
//! - **Frame log**: bounded per-connection history served by
//!   `Network.getWebSocketFrames`

pub mod config;
pub mod error;
pub mod types;

pub use config::NetworkConfig;
pub use error::{CdpError, NetworkError, Result};
pub use types::{CdpEvent, Direction, WebSocketConnection, WebSocketFrame, WebSocketState};

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use ws_engine::{
    parse_extensions, DeflateOptions, Limiter, PerMessageDeflate, Receiver, ReceiverConfig,
    ReceiverEvent, EXTENSION_NAME,
};

/// Per-connection decoding state
#[derive(Debug)]
struct Decoders {
    /// Frames from the remote server, decoded as a client would
    received: Arc<AsyncMutex<Receiver>>,
    /// Frames from the inspected process, decoded as a server would
    sent: Arc<AsyncMutex<Receiver>>,
    /// permessage-deflate instances backing the two decoders
    extensions: Vec<Arc<PerMessageDeflate>>,
}

impl Decoders {
    fn cleanup(&self) {
        for extension in &self.extensions {
            extension.cleanup();
        }
    }
}

/// Network domain implementation for Chrome DevTools Protocol
#[derive(Debug)]
pub struct NetworkDomain {
    config: NetworkConfig,
    /// Whether events are being published
    enabled: Arc<AtomicBool>,
    /// Compression limiter shared by every inspected connection
    limiter: Limiter,
    /// WebSocket connections (RequestId → WebSocketConnection)
    websocket_connections: Arc<DashMap<String, WebSocketConnection>>,
    /// Decoders (RequestId → Decoders)
    decoders: Arc<DashMap<String, Decoders>>,
    /// Event broadcaster
    event_sender: broadcast::Sender<CdpEvent>,
}

impl NetworkDomain {
    /// Create a new NetworkDomain instance
    ///
    /// # Example
    /// ```
    /// use network_domain::NetworkDomain;
    ///
    /// let domain = NetworkDomain::new();
    /// assert_eq!(domain.name(), "Network");
    /// ```
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    /// Create a NetworkDomain with custom configuration
    pub fn with_config(config: NetworkConfig) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        let limiter = config.deflate.limiter();
        Self {
            config,
            enabled: Arc::new(AtomicBool::new(false)),
            limiter,
            websocket_connections: Arc::new(DashMap::new()),
            decoders: Arc::new(DashMap::new()),
            event_sender,
        }
    }

    /// Domain name
    pub fn name(&self) -> &str {
        "Network"
    }

    /// Active configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Compression limiter shared by all connections
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Subscribe to CDP events
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.event_sender.subscribe()
    }

    /// Check if event publishing is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable network monitoring
    ///
    /// Buffer size hints in `params` are accepted and logged.
    pub async fn enable(&self, params: Option<Value>) -> Result<Value> {
        if let Some(p) = &params {
            if let Some(max_buffer) = p.get("maxTotalBufferSize") {
                debug!("Network.enable maxTotalBufferSize: {}", max_buffer);
            }
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!("Network domain enabled");
        Ok(json!({}))
    }

    /// Disable network monitoring
    pub async fn disable(&self) -> Result<Value> {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Network domain disabled");
        Ok(json!({}))
    }

    fn emit(&self, method: &str, params: Value) {
        if !self.is_enabled() {
            return;
        }
        // no subscribers is not an error
        let _ = self.event_sender.send(CdpEvent::new(method, params));
    }

    fn build_decoders(&self, extensions: Vec<Arc<PerMessageDeflate>>) -> Decoders {
        let base = ReceiverConfig::default()
            .with_max_payload(self.config.max_payload)
            .with_skip_utf8_validation(self.config.skip_utf8_validation);

        let mut received = base.clone();
        let mut sent = base;
        sent.is_server = true;
        for extension in &extensions {
            if extension.is_server() {
                sent = sent.with_extension(Arc::clone(extension));
            } else {
                received = received.with_extension(Arc::clone(extension));
            }
        }

        Decoders {
            received: Arc::new(AsyncMutex::new(Receiver::new(received))),
            sent: Arc::new(AsyncMutex::new(Receiver::new(sent))),
            extensions,
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Track a new WebSocket connection
    pub fn track_websocket(&self, request_id: String, url: String) -> Result<()> {
        if self.websocket_connections.contains_key(&request_id) {
            return Err(NetworkError::DuplicateConnection(request_id));
        }
        debug!("Tracking WebSocket connection: {} ({})", request_id, url);

        self.emit(
            "Network.webSocketCreated",
            json!({ "requestId": request_id, "url": url }),
        );
        self.decoders
            .insert(request_id.clone(), self.build_decoders(Vec::new()));
        self.websocket_connections
            .insert(request_id.clone(), WebSocketConnection::new(request_id, url));
        Ok(())
    }

    /// Record the handshake response and set up decompression
    ///
    /// `extensions` is the `Sec-WebSocket-Extensions` header the server
    /// answered with. When it names permessage-deflate, both decoders of the
    /// connection inflate compressed messages from then on.
    pub fn websocket_handshake(&self, request_id: &str, extensions: Option<&str>) -> Result<()> {
        if !self.websocket_connections.contains_key(request_id) {
            return Err(NetworkError::ConnectionNotFound(request_id.to_string()));
        }

        let mut negotiated = Vec::new();
        if let Some(header) = extensions {
            let offers = parse_extensions(header)?;
            if let Some(offer) = offers.iter().find(|o| o.name == EXTENSION_NAME) {
                // parameters are taken verbatim from the observed response
                for is_server in [false, true] {
                    let extension = Arc::new(PerMessageDeflate::new(
                        DeflateOptions::default(),
                        is_server,
                        self.config.max_payload,
                        self.limiter.clone(),
                    ));
                    extension.adopt(&offer.params)?;
                    negotiated.push(extension);
                }
            }
        }

        debug!(
            "WebSocket {} handshake complete (permessage-deflate: {})",
            request_id,
            !negotiated.is_empty()
        );

        let decoders = self.build_decoders(negotiated);
        if let Some(previous) = self.decoders.insert(request_id.to_string(), decoders) {
            previous.cleanup();
        }

        if let Some(mut conn) = self.websocket_connections.get_mut(request_id) {
            conn.state = WebSocketState::Open;
            conn.extensions = extensions.map(str::to_string);
        }

        let mut headers = serde_json::Map::new();
        if let Some(header) = extensions {
            headers.insert("Sec-WebSocket-Extensions".to_string(), json!(header));
        }
        self.emit(
            "Network.webSocketHandshakeResponseReceived",
            json!({
                "requestId": request_id,
                "timestamp": types::timestamp(),
                "response": {
                    "status": 101,
                    "statusText": "Switching Protocols",
                    "headers": headers,
                }
            }),
        );
        Ok(())
    }

    /// Feed bytes observed on a connection and record the decoded frames
    ///
    /// Returns the frames completed by this chunk. A protocol violation is
    /// reported as a `Network.webSocketFrameError` event and returned; frames
    /// decoded before it are still recorded.
    pub async fn ingest(
        &self,
        request_id: &str,
        direction: Direction,
        data: &[u8],
    ) -> Result<Vec<WebSocketFrame>> {
        let receiver = {
            let decoders = self
                .decoders
                .get(request_id)
                .ok_or_else(|| NetworkError::ConnectionNotFound(request_id.to_string()))?;
            match direction {
                Direction::Sent => Arc::clone(&decoders.sent),
                Direction::Received => Arc::clone(&decoders.received),
            }
        };

        let mut events = Vec::new();
        let mut failure = None;
        {
            let mut receiver = receiver.lock().await;
            match receiver.write(data) {
                Ok(()) => loop {
                    match receiver.next_event().await {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => break,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                },
                Err(e) => {
                    events.extend(receiver.drain_events().unwrap_or_default());
                    failure = Some(e);
                }
            }
        }

        let frames = self.record_frames(request_id, direction, events);

        if let Some(source) = failure {
            warn!(
                "WebSocket {} {:?} stream failed: {} (close code {})",
                request_id,
                direction,
                source,
                source.close_code()
            );
            self.emit(
                "Network.webSocketFrameError",
                json!({
                    "requestId": request_id,
                    "timestamp": types::timestamp(),
                    "errorMessage": source.to_string(),
                }),
            );
            return Err(NetworkError::Protocol {
                request_id: request_id.to_string(),
                source,
            });
        }

        Ok(frames)
    }

    fn record_frames(
        &self,
        request_id: &str,
        direction: Direction,
        events: Vec<ReceiverEvent>,
    ) -> Vec<WebSocketFrame> {
        let method = match direction {
            Direction::Sent => "Network.webSocketFrameSent",
            Direction::Received => "Network.webSocketFrameReceived",
        };

        let mut frames = Vec::with_capacity(events.len());
        for event in events {
            let closing = matches!(event, ReceiverEvent::Conclude { .. });
            let frame = WebSocketFrame::from_event(event, direction);

            if let Some(mut conn) = self.websocket_connections.get_mut(request_id) {
                if closing && conn.state != WebSocketState::Closed {
                    conn.state = WebSocketState::Closing;
                }
                conn.add_frame(frame.clone(), self.config.max_frames_per_connection);
            }

            self.emit(
                method,
                json!({
                    "requestId": request_id,
                    "timestamp": frame.timestamp,
                    "response": frame.to_cdp(),
                }),
            );
            frames.push(frame);
        }
        frames
    }

    /// Mark a connection closed and release its decoders
    pub fn close_websocket(&self, request_id: &str) -> Result<()> {
        let mut conn = self
            .websocket_connections
            .get_mut(request_id)
            .ok_or_else(|| NetworkError::ConnectionNotFound(request_id.to_string()))?;
        conn.state = WebSocketState::Closed;
        drop(conn);

        if let Some((_, decoders)) = self.decoders.remove(request_id) {
            decoders.cleanup();
        }
        debug!("Closed WebSocket connection: {}", request_id);
        self.emit(
            "Network.webSocketClosed",
            json!({ "requestId": request_id, "timestamp": types::timestamp() }),
        );
        Ok(())
    }

    /// Remove a connection from tracking
    pub fn untrack_websocket(&self, request_id: &str) {
        debug!("Untracking WebSocket connection: {}", request_id);
        self.websocket_connections.remove(request_id);
        if let Some((_, decoders)) = self.decoders.remove(request_id) {
            decoders.cleanup();
        }
    }

    /// Check if a WebSocket connection is being tracked
    pub fn has_websocket(&self, request_id: &str) -> bool {
        self.websocket_connections.contains_key(request_id)
    }

    /// Get all frames recorded for a connection
    pub fn get_websocket_frames(&self, request_id: &str) -> Option<Vec<WebSocketFrame>> {
        self.websocket_connections
            .get(request_id)
            .map(|conn| conn.frames.iter().cloned().collect())
    }

    /// Get WebSocket connection info
    pub fn get_websocket_connection(&self, request_id: &str) -> Option<WebSocketConnection> {
        self.websocket_connections.get(request_id).map(|r| r.clone())
    }

    /// Get all WebSocket connections
    pub fn get_all_websocket_connections(&self) -> Vec<WebSocketConnection> {
        self.websocket_connections
            .iter()
            .map(|r| r.value().clone())
            .collect()
    }

    // =========================================================================
    // CDP methods
    // =========================================================================

    /// CDP method: Network.getWebSocketFrames
    pub async fn get_websocket_frame_data(&self, params: Option<Value>) -> Result<Value> {
        let params =
            params.ok_or_else(|| NetworkError::InvalidParams("Missing parameters".into()))?;

        let request_id = params
            .get("requestId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NetworkError::InvalidParams("Missing requestId parameter".into()))?;

        let connection = self
            .websocket_connections
            .get(request_id)
            .ok_or_else(|| NetworkError::ConnectionNotFound(request_id.to_string()))?;

        let frames: Vec<Value> = connection
            .frames
            .iter()
            .map(|frame| {
                json!({
                    "opcode": frame.opcode,
                    "mask": frame.mask,
                    "payloadData": frame.payload_data,
                    "isBase64": frame.is_base64,
                    "timestamp": frame.timestamp,
                    "direction": frame.direction,
                })
            })
            .collect();

        Ok(json!({
            "requestId": request_id,
            "url": connection.url,
            "state": connection.state,
            "timestamp": connection.timestamp,
            "frames": frames
        }))
    }

    /// Handle a method call for the Network domain
    ///
    /// `method` is given without the `Network.` prefix.
    pub async fn handle_method(&self, method: &str, params: Option<Value>) -> Result<Value> {
        debug!("Network domain handling method: {}", method);

        match method {
            "enable" => self.enable(params).await,
            "disable" => self.disable().await,
            "getWebSocketFrames" => self.get_websocket_frame_data(params).await,
            _ => {
                warn!("Unknown Network method: {}", method);
                Err(NetworkError::MethodNotFound(method.to_string()))
            }
        }
    }
}

impl Default for NetworkDomain {
    fn default() -> Self {
        Self::new()
    }
}
