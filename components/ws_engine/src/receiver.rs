//! Incremental RFC 6455 frame decoder
//!
//! A [`Receiver`] accepts raw bytes in chunks of any size and turns them into
//! [`ReceiverEvent`]s. The output never depends on how the input was split.
//!
//! ```
//! use ws_engine::{MessageData, Receiver, ReceiverConfig, ReceiverEvent};
//!
//! let mut receiver = Receiver::new(ReceiverConfig::new(true));
//! receiver
//!     .write(&[0x81, 0x85, 0, 0, 0, 0, b'H', b'e', b'l', b'l', b'o'])
//!     .unwrap();
//!
//! match receiver.poll_event().unwrap() {
//!     Some(ReceiverEvent::Message { data: MessageData::Buffer(text), is_binary }) => {
//!         assert!(!is_binary);
//!         assert_eq!(&text[..], b"Hello");
//!     }
//!     other => panic!("unexpected event {:?}", other),
//! }
//! ```

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, trace, warn};

use crate::buffer_util::{concat, to_array_buffer, unmask, Blob};
use crate::config::{BinaryType, ReceiverConfig};
use crate::error::{DeflateError, ProtocolError, Result};
use crate::validation::{is_valid_status_code, is_valid_utf8};

const OPCODE_CONTINUATION: u8 = 0x00;
const OPCODE_TEXT: u8 = 0x01;
const OPCODE_BINARY: u8 = 0x02;
const OPCODE_CLOSE: u8 = 0x08;
const OPCODE_PING: u8 = 0x09;
const OPCODE_PONG: u8 = 0x0a;

/// Largest payload a control frame may carry
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Close code reported when a close frame has no body
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// High 32 bits of a 64-bit length may not exceed this (2^53 - 1 overall)
const MAX_LENGTH_HIGH_BITS: u32 = (1 << 21) - 1;

/// A completed message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    /// Contiguous buffer; always used for text messages
    Buffer(Bytes),
    /// Standalone byte array
    ArrayBuffer(Vec<u8>),
    /// Fragments in arrival order
    Fragments(Vec<Bytes>),
    /// Blob built from the fragments
    Blob(Blob),
}

impl MessageData {
    /// Total payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            MessageData::Buffer(buf) => buf.len(),
            MessageData::ArrayBuffer(vec) => vec.len(),
            MessageData::Fragments(list) => list.iter().map(Bytes::len).sum(),
            MessageData::Blob(blob) => blob.size(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten the payload into one buffer
    pub fn into_bytes(self) -> Bytes {
        match self {
            MessageData::Buffer(buf) => buf,
            MessageData::ArrayBuffer(vec) => Bytes::from(vec),
            MessageData::Fragments(list) => {
                let total = list.iter().map(Bytes::len).sum();
                concat(&list, total)
            }
            MessageData::Blob(blob) => blob.array_buffer(),
        }
    }
}

/// Output of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// A complete text or binary message
    Message {
        /// Payload
        data: MessageData,
        /// `false` for text, which has already passed UTF-8 validation
        is_binary: bool,
    },
    /// Ping frame
    Ping(Bytes),
    /// Pong frame
    Pong(Bytes),
    /// Close frame; no further events follow
    Conclude {
        /// Status code, 1005 when the frame had no body
        code: u16,
        /// UTF-8 close reason
        reason: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    AwaitingExtendedLength16,
    AwaitingExtendedLength64,
    AwaitingMaskKey,
    AwaitingPayload,
    Inflating,
    Errored,
    Closed,
}

/// Frame decoder for one side of one connection
#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    state: State,

    buffers: VecDeque<Bytes>,
    buffered_bytes: usize,

    fin: bool,
    masked: bool,
    mask: [u8; 4],
    opcode: u8,
    payload_length: u64,
    compressed: bool,

    fragmented: Option<u8>,
    fragments: Vec<Bytes>,
    total_payload_length: u64,
    message_length: u64,

    inflating: Option<oneshot::Receiver<std::result::Result<Bytes, DeflateError>>>,
    events: VecDeque<ReceiverEvent>,
    paused: bool,
    error: Option<ProtocolError>,
}

impl Receiver {
    /// Create a decoder
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            state: State::AwaitingHeader,
            buffers: VecDeque::new(),
            buffered_bytes: 0,
            fin: false,
            masked: false,
            mask: [0; 4],
            opcode: 0,
            payload_length: 0,
            compressed: false,
            fragmented: None,
            fragments: Vec::new(),
            total_payload_length: 0,
            message_length: 0,
            inflating: None,
            events: VecDeque::new(),
            paused: false,
            error: None,
        }
    }

    /// Decoder configuration
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Bytes received but not yet decoded
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Whether a close frame has been decoded
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// The error that stopped the decoder, if any
    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Feed a chunk of raw input
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(chunk))
    }

    /// Feed a chunk of raw input without copying it
    ///
    /// Events decoded before a protocol error stay queued and can still be
    /// drained. Once stopped by an error, every later write returns that
    /// error. Input after a close frame is ignored.
    pub fn write_bytes(&mut self, chunk: Bytes) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.state == State::Closed {
            trace!(len = chunk.len(), "ignoring input after close");
            return Ok(());
        }

        if !chunk.is_empty() {
            self.buffered_bytes += chunk.len();
            self.buffers.push_back(chunk);
        }
        self.run()
    }

    /// Take the next decoded event, resuming decoding if it was paused
    pub fn poll_event(&mut self) -> Result<Option<ReceiverEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        self.paused = false;
        self.run()?;
        Ok(self.events.pop_front())
    }

    /// Take every event that can be produced without waiting
    pub fn drain_events(&mut self) -> Result<Vec<ReceiverEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.poll_event()? {
            events.push(event);
        }
        Ok(events)
    }

    /// Take the next event, waiting for pending decompression if needed
    ///
    /// Returns `None` once more input is required.
    pub async fn next_event(&mut self) -> Result<Option<ReceiverEvent>> {
        loop {
            if let Some(event) = self.poll_event()? {
                return Ok(Some(event));
            }
            let Some(pending) = self.inflating.as_mut() else {
                return Ok(None);
            };
            let result = pending
                .await
                .unwrap_or(Err(DeflateError::Closed("inflate")));
            self.inflating = None;
            if let Err(e) = self.finish_inflate(result) {
                self.fail(e.clone());
                return Err(e);
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        match self.decode() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        warn!(
            code = error.code(),
            close_code = error.close_code(),
            error = %error,
            "websocket protocol violation"
        );
        self.state = State::Errored;
        self.error = Some(error);
        self.inflating = None;
        self.buffers.clear();
        self.buffered_bytes = 0;
    }

    fn decode(&mut self) -> Result<()> {
        loop {
            if self.paused {
                return Ok(());
            }
            let progressed = match self.state {
                State::AwaitingHeader => self.read_header()?,
                State::AwaitingExtendedLength16 => self.read_length16()?,
                State::AwaitingExtendedLength64 => self.read_length64()?,
                State::AwaitingMaskKey => self.read_mask_key()?,
                State::AwaitingPayload => self.read_payload()?,
                State::Inflating => self.poll_inflate()?,
                State::Errored | State::Closed => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn consume(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }
        self.buffered_bytes -= n;

        if let Some(front) = self.buffers.front_mut() {
            if n == front.len() {
                return self.buffers.pop_front().unwrap_or_default();
            }
            if n < front.len() {
                return front.split_to(n);
            }
        }

        let mut dst = BytesMut::with_capacity(n);
        while dst.len() < n {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let take = (n - dst.len()).min(front.len());
            dst.extend_from_slice(&front.split_to(take));
            if front.is_empty() {
                self.buffers.pop_front();
            }
        }
        dst.freeze()
    }

    fn deflate_negotiated(&self) -> bool {
        self.config
            .extension
            .as_ref()
            .map_or(false, |ext| ext.is_negotiated())
    }

    fn read_header(&mut self) -> Result<bool> {
        if self.buffered_bytes < 2 {
            return Ok(false);
        }
        let header = self.consume(2);
        let (b0, b1) = (header[0], header[1]);

        if b0 & 0x30 != 0 {
            return Err(ProtocolError::UnexpectedReservedBits);
        }
        let rsv1 = b0 & 0x40 != 0;
        if rsv1 && !self.deflate_negotiated() {
            return Err(ProtocolError::UnexpectedReservedBit1);
        }

        self.fin = b0 & 0x80 != 0;
        self.masked = b1 & 0x80 != 0;
        self.payload_length = u64::from(b1 & 0x7f);
        let opcode = b0 & 0x0f;

        if self.config.is_server && !self.masked {
            return Err(ProtocolError::ExpectedMask);
        }
        if !self.config.is_server && self.masked {
            return Err(ProtocolError::UnexpectedMask);
        }

        match opcode {
            OPCODE_CONTINUATION => {
                if rsv1 {
                    return Err(ProtocolError::UnexpectedReservedBit1);
                }
                let Some(open) = self.fragmented else {
                    return Err(ProtocolError::InvalidOpcode(opcode));
                };
                self.opcode = open;
            }
            OPCODE_TEXT | OPCODE_BINARY => {
                if self.fragmented.is_some() {
                    return Err(ProtocolError::InvalidOpcode(opcode));
                }
                self.opcode = opcode;
                self.compressed = rsv1;
            }
            OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => {
                if !self.fin {
                    return Err(ProtocolError::ExpectedFin);
                }
                if rsv1 {
                    return Err(ProtocolError::UnexpectedReservedBit1);
                }
                if self.payload_length > MAX_CONTROL_PAYLOAD
                    || (opcode == OPCODE_CLOSE && self.payload_length == 1)
                {
                    return Err(ProtocolError::InvalidControlPayloadLength(
                        self.payload_length,
                    ));
                }
                self.opcode = opcode;
            }
            _ => return Err(ProtocolError::InvalidOpcode(opcode)),
        }

        if !self.fin && self.fragmented.is_none() {
            self.fragmented = Some(self.opcode);
        }

        trace!(
            fin = self.fin,
            opcode = self.opcode,
            rsv1,
            masked = self.masked,
            length = self.payload_length,
            "frame header"
        );

        match self.payload_length {
            126 => self.state = State::AwaitingExtendedLength16,
            127 => self.state = State::AwaitingExtendedLength64,
            _ => self.have_length()?,
        }
        Ok(true)
    }

    fn read_length16(&mut self) -> Result<bool> {
        if self.buffered_bytes < 2 {
            return Ok(false);
        }
        let buf = self.consume(2);
        self.payload_length = u64::from(u16::from_be_bytes([buf[0], buf[1]]));
        self.have_length()?;
        Ok(true)
    }

    fn read_length64(&mut self) -> Result<bool> {
        if self.buffered_bytes < 8 {
            return Ok(false);
        }
        let buf = self.consume(8);
        let high = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let low = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if high > MAX_LENGTH_HIGH_BITS {
            return Err(ProtocolError::UnsupportedDataPayloadLength);
        }
        self.payload_length = (u64::from(high) << 32) | u64::from(low);
        self.have_length()?;
        Ok(true)
    }

    fn have_length(&mut self) -> Result<()> {
        let max_payload = self.config.max_payload;
        if self.opcode < OPCODE_CLOSE {
            self.total_payload_length += self.payload_length;
            if max_payload > 0 && self.total_payload_length > max_payload {
                return Err(ProtocolError::UnsupportedMessageLength);
            }
        } else if max_payload > 0 && self.payload_length > max_payload {
            return Err(ProtocolError::UnsupportedMessageLength);
        }

        self.state = if self.masked {
            State::AwaitingMaskKey
        } else {
            State::AwaitingPayload
        };
        Ok(())
    }

    fn read_mask_key(&mut self) -> Result<bool> {
        if self.buffered_bytes < 4 {
            return Ok(false);
        }
        let key = self.consume(4);
        self.mask = [key[0], key[1], key[2], key[3]];
        self.state = State::AwaitingPayload;
        Ok(true)
    }

    fn read_payload(&mut self) -> Result<bool> {
        let length = usize::try_from(self.payload_length)
            .map_err(|_| ProtocolError::UnsupportedDataPayloadLength)?;
        if self.buffered_bytes < length {
            return Ok(false);
        }

        let mut data = self.consume(length);
        if self.masked && self.mask != [0; 4] {
            let mut owned = Vec::from(data);
            unmask(&mut owned, self.mask);
            data = Bytes::from(owned);
        }

        if self.opcode > 0x07 {
            self.control_message(data)?;
            return Ok(true);
        }

        if self.compressed {
            self.start_inflate(data)?;
            return Ok(true);
        }

        if !data.is_empty() {
            self.message_length = self.total_payload_length;
            self.fragments.push(data);
        }
        self.state = State::AwaitingHeader;
        if self.fin {
            self.data_message()?;
        }
        Ok(true)
    }

    fn start_inflate(&mut self, data: Bytes) -> Result<()> {
        let Some(extension) = self.config.extension.clone() else {
            return Err(ProtocolError::UnexpectedReservedBit1);
        };

        let (tx, rx) = oneshot::channel();
        self.inflating = Some(rx);
        self.state = State::Inflating;
        trace!(len = data.len(), fin = self.fin, "inflating frame payload");

        extension.decompress(data, self.fin, move |result| {
            let _ = tx.send(result);
        });
        Ok(())
    }

    fn poll_inflate(&mut self) -> Result<bool> {
        let Some(pending) = self.inflating.as_mut() else {
            return Ok(false);
        };
        let result = match pending.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return Ok(false),
            Err(TryRecvError::Closed) => Err(DeflateError::Closed("inflate")),
        };
        self.inflating = None;
        self.finish_inflate(result)?;
        Ok(true)
    }

    fn finish_inflate(&mut self, result: std::result::Result<Bytes, DeflateError>) -> Result<()> {
        let data = result?;

        if !data.is_empty() {
            self.message_length += data.len() as u64;
            let max_payload = self.config.max_payload;
            if max_payload > 0 && self.message_length > max_payload {
                return Err(ProtocolError::UnsupportedMessageLength);
            }
            self.fragments.push(data);
        }

        self.state = State::AwaitingHeader;
        if self.fin {
            self.data_message()?;
        }
        Ok(())
    }

    fn data_message(&mut self) -> Result<()> {
        let fragments = std::mem::take(&mut self.fragments);
        let length = self.message_length as usize;
        self.total_payload_length = 0;
        self.message_length = 0;
        self.fragmented = None;

        let event = if self.opcode == OPCODE_BINARY {
            let data = match self.config.binary_type {
                BinaryType::Buffer => MessageData::Buffer(concat(&fragments, length)),
                BinaryType::ArrayBuffer => {
                    MessageData::ArrayBuffer(to_array_buffer(concat(&fragments, length)))
                }
                BinaryType::Fragments => MessageData::Fragments(fragments),
                BinaryType::Blob => MessageData::Blob(Blob::new(fragments, "")),
            };
            ReceiverEvent::Message {
                data,
                is_binary: true,
            }
        } else {
            let text = concat(&fragments, length);
            if !self.config.skip_utf8_validation && !is_valid_utf8(&text) {
                return Err(ProtocolError::InvalidUtf8);
            }
            ReceiverEvent::Message {
                data: MessageData::Buffer(text),
                is_binary: false,
            }
        };

        self.emit(event);
        Ok(())
    }

    fn control_message(&mut self, data: Bytes) -> Result<()> {
        match self.opcode {
            OPCODE_CLOSE => {
                let (code, reason) = if data.is_empty() {
                    (NO_STATUS_RECEIVED, Bytes::new())
                } else {
                    let code = u16::from_be_bytes([data[0], data[1]]);
                    if !is_valid_status_code(code) {
                        return Err(ProtocolError::InvalidCloseCode(code));
                    }
                    let reason = data.slice(2..);
                    if !self.config.skip_utf8_validation && !is_valid_utf8(&reason) {
                        return Err(ProtocolError::InvalidUtf8);
                    }
                    (code, reason)
                };

                debug!(code, reason_len = reason.len(), "close frame received");
                self.state = State::Closed;
                self.buffers.clear();
                self.buffered_bytes = 0;
                self.emit(ReceiverEvent::Conclude { code, reason });
            }
            OPCODE_PING => {
                self.state = State::AwaitingHeader;
                self.emit(ReceiverEvent::Ping(data));
            }
            _ => {
                self.state = State::AwaitingHeader;
                self.emit(ReceiverEvent::Pong(data));
            }
        }
        Ok(())
    }

    fn emit(&mut self, event: ReceiverEvent) {
        self.events.push_back(event);
        if !self.config.allow_synchronous_events {
            self.paused = true;
        }
    }
}
