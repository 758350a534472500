//! WebSocket receive engine
//!
//! Decodes the receive side of RFC 6455 connections and implements the
//! permessage-deflate extension (RFC 7692) shared by both directions.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ws_engine::{
//!     DeflateOptions, Limiter, PerMessageDeflate, Receiver, ReceiverConfig, ReceiverEvent,
//! };
//!
//! // One limiter for the whole process bounds concurrent zlib work
//! let limiter = Limiter::default();
//!
//! let deflate = Arc::new(PerMessageDeflate::new(
//!     DeflateOptions::default(),
//!     true,
//!     0,
//!     limiter,
//! ));
//! let offers = ws_engine::parse_extensions("permessage-deflate; client_max_window_bits")?;
//! deflate.accept(&[offers[0].params.clone()])?;
//!
//! let mut receiver = Receiver::new(ReceiverConfig::new(true).with_extension(deflate));
//! receiver.write(&[0x89, 0x80, 1, 2, 3, 4])?;
//! assert!(matches!(receiver.poll_event()?, Some(ReceiverEvent::Ping(_))));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Public modules
pub mod buffer_util;
pub mod config;
pub mod error;
pub mod extension;
pub mod limiter;
pub mod permessage_deflate;
pub mod receiver;
pub mod validation;

// Re-export main types
pub use buffer_util::{
    concat, mask, to_array_buffer, to_buffer, unmask, BinaryData, Blob, Converted, Ownership,
};
pub use config::{BinaryType, ReceiverConfig};
pub use error::{DeflateError, NegotiationError, ProtocolError, Result};
pub use extension::{
    format_extensions, normalize_params, parse_extensions, ExtensionOffer, ExtensionParams,
    ParamValue, RawParams, WindowBits,
};
pub use limiter::{Done, Limiter, DEFAULT_CONCURRENCY};
pub use permessage_deflate::{
    DeflateOptions, PerMessageDeflate, WindowBitsPolicy, EXTENSION_NAME,
};
pub use receiver::{MessageData, Receiver, ReceiverEvent};
pub use validation::{is_blob, is_valid_status_code, is_valid_utf8, ObjectShape};
