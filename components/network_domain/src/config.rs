//! Network domain configuration

use serde::{Deserialize, Serialize};
use ws_engine::DeflateOptions;

/// Default cap on recorded frames per connection
pub const DEFAULT_MAX_FRAMES_PER_CONNECTION: usize = 1000;

/// Configuration for [`NetworkDomain`](crate::NetworkDomain)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Largest inspected message in bytes, 0 for unlimited
    pub max_payload: u64,

    /// Record text frames without validating their UTF-8
    pub skip_utf8_validation: bool,

    /// Oldest frames are dropped past this many per connection
    pub max_frames_per_connection: usize,

    /// Capacity of the CDP event broadcast channel
    pub event_capacity: usize,

    /// Local permessage-deflate policy used when decoding inspected streams
    pub deflate: DeflateOptions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_payload: 100 * 1024 * 1024, // 100MB
            skip_utf8_validation: false,
            max_frames_per_connection: DEFAULT_MAX_FRAMES_PER_CONNECTION,
            event_capacity: 100,
            deflate: DeflateOptions::default(),
        }
    }
}

impl NetworkConfig {
    /// Set maximum inspected message size
    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Skip UTF-8 validation of text frames
    pub fn with_skip_utf8_validation(mut self, skip: bool) -> Self {
        self.skip_utf8_validation = skip;
        self
    }

    /// Set the per-connection frame log size
    pub fn with_max_frames_per_connection(mut self, max: usize) -> Self {
        self.max_frames_per_connection = max;
        self
    }

    /// Set event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set permessage-deflate options
    pub fn with_deflate(mut self, deflate: DeflateOptions) -> Self {
        self.deflate = deflate;
        self
    }
}
