//! Receiver configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::permessage_deflate::PerMessageDeflate;

/// How completed binary messages are handed to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryType {
    /// One contiguous shared buffer
    #[default]
    Buffer,
    /// A standalone owned byte array
    ArrayBuffer,
    /// The list of fragments as received
    Fragments,
    /// An immutable blob
    Blob,
}

/// Configuration for a frame [`Receiver`](crate::receiver::Receiver)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Whether this endpoint is the server (expects masked frames)
    pub is_server: bool,

    /// Largest accepted message or control payload in bytes, 0 for unlimited
    pub max_payload: u64,

    /// Skip UTF-8 checks on text messages and close reasons
    pub skip_utf8_validation: bool,

    /// Representation of binary messages
    pub binary_type: BinaryType,

    /// Decode everything available on each write instead of pausing after
    /// every dispatched event
    pub allow_synchronous_events: bool,

    /// Negotiated permessage-deflate instance, if any
    #[serde(skip)]
    pub extension: Option<Arc<PerMessageDeflate>>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            is_server: false,
            max_payload: 100 * 1024 * 1024, // 100MB
            skip_utf8_validation: false,
            binary_type: BinaryType::Buffer,
            allow_synchronous_events: true,
            extension: None,
        }
    }
}

impl ReceiverConfig {
    /// Create a configuration for a client or server endpoint
    pub fn new(is_server: bool) -> Self {
        Self {
            is_server,
            ..Default::default()
        }
    }

    /// Set the payload limit
    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Skip UTF-8 validation
    pub fn with_skip_utf8_validation(mut self, skip: bool) -> Self {
        self.skip_utf8_validation = skip;
        self
    }

    /// Set binary message representation
    pub fn with_binary_type(mut self, binary_type: BinaryType) -> Self {
        self.binary_type = binary_type;
        self
    }

    /// Allow or forbid decoding past a dispatched event within one write
    pub fn with_allow_synchronous_events(mut self, allow: bool) -> Self {
        self.allow_synchronous_events = allow;
        self
    }

    /// Attach a negotiated permessage-deflate instance
    pub fn with_extension(mut self, extension: Arc<PerMessageDeflate>) -> Self {
        self.extension = Some(extension);
        self
    }
}
