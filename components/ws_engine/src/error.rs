//! Error types for the WebSocket engine

use thiserror::Error;

/// Fatal violations detected while decoding a frame stream
///
/// Every variant ends the connection. [`ProtocolError::close_code`] gives the
/// status code the caller should put in its own close frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// RSV2 or RSV3 was set
    #[error("Invalid WebSocket frame: RSV2 and RSV3 must be clear")]
    UnexpectedReservedBits,

    /// RSV1 was set where no extension allows it
    #[error("Invalid WebSocket frame: RSV1 must be clear")]
    UnexpectedReservedBit1,

    /// Server endpoint received an unmasked frame
    #[error("Invalid WebSocket frame: MASK must be set")]
    ExpectedMask,

    /// Client endpoint received a masked frame
    #[error("Invalid WebSocket frame: MASK must be clear")]
    UnexpectedMask,

    /// Unknown opcode, orphan continuation, or interleaved data frame
    #[error("Invalid WebSocket frame: invalid opcode {0}")]
    InvalidOpcode(u8),

    /// Control frame with FIN clear
    #[error("Invalid WebSocket frame: FIN must be set")]
    ExpectedFin,

    /// Control payload over 125 bytes, or a close payload of exactly 1 byte
    #[error("Invalid WebSocket frame: invalid payload length {0}")]
    InvalidControlPayloadLength(u64),

    /// 64-bit length beyond 2^53 - 1
    #[error("Unsupported WebSocket frame: payload length > 2^53 - 1")]
    UnsupportedDataPayloadLength,

    /// Payload or reassembled message beyond `max_payload`
    #[error("Max payload size exceeded")]
    UnsupportedMessageLength,

    /// Close frame carrying an illegal status code
    #[error("Invalid WebSocket frame: invalid status code {0}")]
    InvalidCloseCode(u16),

    /// Malformed UTF-8 in a text message or close reason
    #[error("Invalid WebSocket frame: invalid UTF-8 sequence")]
    InvalidUtf8,

    /// Decompression of a compressed message failed
    #[error("Decompression failed: {0}")]
    Decompression(#[from] DeflateError),
}

impl ProtocolError {
    /// Close status code to send back to the peer
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::UnsupportedDataPayloadLength
            | ProtocolError::UnsupportedMessageLength => 1009,
            ProtocolError::InvalidUtf8 => 1007,
            ProtocolError::Decompression(DeflateError::SizeExceeded) => 1009,
            ProtocolError::Decompression(_) => 1007,
            _ => 1002,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnexpectedReservedBits => "WS_ERR_UNEXPECTED_RSV_2_3",
            ProtocolError::UnexpectedReservedBit1 => "WS_ERR_UNEXPECTED_RSV_1",
            ProtocolError::ExpectedMask => "WS_ERR_EXPECTED_MASK",
            ProtocolError::UnexpectedMask => "WS_ERR_UNEXPECTED_MASK",
            ProtocolError::InvalidOpcode(_) => "WS_ERR_INVALID_OPCODE",
            ProtocolError::ExpectedFin => "WS_ERR_EXPECTED_FIN",
            ProtocolError::InvalidControlPayloadLength(_) => {
                "WS_ERR_INVALID_CONTROL_PAYLOAD_LENGTH"
            }
            ProtocolError::UnsupportedDataPayloadLength => "WS_ERR_UNSUPPORTED_DATA_PAYLOAD_LENGTH",
            ProtocolError::UnsupportedMessageLength => "WS_ERR_UNSUPPORTED_MESSAGE_LENGTH",
            ProtocolError::InvalidCloseCode(_) => "WS_ERR_INVALID_CLOSE_CODE",
            ProtocolError::InvalidUtf8 => "WS_ERR_INVALID_UTF8",
            ProtocolError::Decompression(DeflateError::SizeExceeded) => {
                "WS_ERR_UNSUPPORTED_MESSAGE_LENGTH"
            }
            ProtocolError::Decompression(_) => "WS_ERR_INFLATE",
        }
    }
}

/// Errors from the permessage-deflate codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeflateError {
    /// Decompressed output grew past `max_payload`
    #[error("Max payload size exceeded")]
    SizeExceeded,

    /// The stream was torn down before a queued job could run
    #[error("The {0} stream was closed while data was being processed")]
    Closed(&'static str),

    /// The extension has not been negotiated yet
    #[error("permessage-deflate has not been negotiated")]
    NotNegotiated,

    /// zlib rejected the input
    #[error("Invalid deflate data: {0}")]
    Inflate(String),

    /// zlib failed while compressing
    #[error("Compression error: {0}")]
    Deflate(String),
}

impl From<flate2::DecompressError> for DeflateError {
    fn from(e: flate2::DecompressError) -> Self {
        DeflateError::Inflate(e.to_string())
    }
}

impl From<flate2::CompressError> for DeflateError {
    fn from(e: flate2::CompressError) -> Self {
        DeflateError::Deflate(e.to_string())
    }
}

/// Errors from permessage-deflate parameter negotiation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// A parameter appeared more than once
    #[error("Parameter \"{0}\" must have only a single value")]
    DuplicateParameter(String),

    /// A parameter carried a value outside its legal range
    #[error("Invalid value for parameter \"{key}\": {value}")]
    InvalidValue {
        /// Parameter name
        key: String,
        /// Offending value as received
        value: String,
    },

    /// A parameter name outside RFC 7692
    #[error("Unknown parameter \"{0}\"")]
    UnknownParameter(String),

    /// Server side found no acceptable offer
    #[error("None of the extension offers can be accepted")]
    NoAcceptableOffer,

    /// Client side received a response that contradicts its offer
    #[error("Unexpected or invalid parameter \"{0}\"")]
    UnexpectedParameter(String),

    /// Malformed Sec-WebSocket-Extensions header text
    #[error("Unexpected character at index {0}")]
    InvalidHeader(usize),

    /// Parameters were already fixed for this connection
    #[error("permessage-deflate parameters were already negotiated")]
    AlreadyNegotiated,
}

/// Result type for receiver operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
