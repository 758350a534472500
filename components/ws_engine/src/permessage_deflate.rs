//! permessage-deflate extension (RFC 7692)
//!
//! One [`PerMessageDeflate`] exists per connection. It negotiates the
//! extension parameters once and then compresses and decompresses message
//! payloads. All codec work is scheduled through a [`Limiter`] shared by
//! every connection, which bounds how much DEFLATE work runs at once.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DeflateError, NegotiationError};
use crate::extension::{normalize_params, ExtensionParams, RawParams, WindowBits};
use crate::limiter::{Limiter, DEFAULT_CONCURRENCY};

/// Registered extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Tail of every sync-flushed DEFLATE block
pub const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Window size used when none was negotiated
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// zlib cannot produce raw streams with an 8-bit window
const MIN_ZLIB_WINDOW_BITS: u8 = 9;

/// Output growth step while inflating or deflating
const CHUNK_SIZE: usize = 16 * 1024;

/// Local policy for a `*_max_window_bits` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowBitsPolicy {
    /// Use exactly this window size
    Bits(u8),
    /// Accept or advertise the parameter without a value
    ///
    /// Only `client_max_window_bits` may appear without a value on the wire;
    /// as a server policy `Max` behaves like leaving the parameter unset.
    Max,
    /// Refuse the parameter entirely
    Disallow,
}

/// Local configuration of the extension
///
/// `None` leaves a parameter to the peer; `Some(false)` / `Disallow`
/// refuses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeflateOptions {
    /// Whether to request or allow server no-context-takeover
    pub server_no_context_takeover: Option<bool>,
    /// Whether to request or allow client no-context-takeover
    pub client_no_context_takeover: Option<bool>,
    /// Server window policy; [`WindowBitsPolicy::Max`] is the same as `None`
    pub server_max_window_bits: Option<WindowBitsPolicy>,
    /// Client window policy
    pub client_max_window_bits: Option<WindowBitsPolicy>,
    /// zlib compression level (0-9)
    pub level: u32,
    /// Payloads below this many bytes are not worth compressing
    pub threshold: usize,
    /// Concurrency for a limiter built by [`DeflateOptions::limiter`]
    pub concurrency_limit: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            server_no_context_takeover: None,
            client_no_context_takeover: None,
            server_max_window_bits: None,
            client_max_window_bits: None,
            level: 6,
            threshold: 1024,
            concurrency_limit: DEFAULT_CONCURRENCY,
        }
    }
}

impl DeflateOptions {
    /// Set server no-context-takeover policy
    pub fn with_server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = Some(value);
        self
    }

    /// Set client no-context-takeover policy
    pub fn with_client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = Some(value);
        self
    }

    /// Set server window policy
    ///
    /// `server_max_window_bits` always carries a value, so
    /// [`WindowBitsPolicy::Max`] is neither offered nor enforced.
    pub fn with_server_max_window_bits(mut self, policy: WindowBitsPolicy) -> Self {
        self.server_max_window_bits = Some(policy);
        self
    }

    /// Set client window policy
    pub fn with_client_max_window_bits(mut self, policy: WindowBitsPolicy) -> Self {
        self.client_max_window_bits = Some(policy);
        self
    }

    /// Set compression level
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    /// Set compression threshold
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the concurrency used by [`DeflateOptions::limiter`]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Build a limiter sized from these options, to be shared by all connections
    pub fn limiter(&self) -> Limiter {
        Limiter::new(self.concurrency_limit)
    }
}

/// Which side of the connection a stream serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Client,
    Server,
}

fn window_bits_for(params: &ExtensionParams, endpoint: Endpoint) -> u8 {
    let value = match endpoint {
        Endpoint::Client => params.client_max_window_bits,
        Endpoint::Server => params.server_max_window_bits,
    };
    value
        .and_then(WindowBits::bits)
        .unwrap_or(DEFAULT_WINDOW_BITS)
        .max(MIN_ZLIB_WINDOW_BITS)
}

fn no_context_takeover(params: &ExtensionParams, endpoint: Endpoint) -> bool {
    match endpoint {
        Endpoint::Client => params.client_no_context_takeover,
        Endpoint::Server => params.server_no_context_takeover,
    }
}

/// Receive-direction stream state
struct InflateStream {
    decompress: Decompress,
    window_bits: u8,
}

impl InflateStream {
    fn new(window_bits: u8) -> Self {
        Self {
            decompress: Decompress::new_with_window_bits(false, window_bits),
            window_bits,
        }
    }

    fn write(
        &mut self,
        input: &[u8],
        output: &mut Vec<u8>,
        max_payload: u64,
    ) -> Result<(), DeflateError> {
        let mut consumed = 0;
        loop {
            if output.capacity() - output.len() < CHUNK_SIZE / 4 {
                output.reserve(CHUNK_SIZE);
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status =
                self.decompress
                    .decompress_vec(&input[consumed..], output, FlushDecompress::Sync)?;

            let read = (self.decompress.total_in() - before_in) as usize;
            let written = self.decompress.total_out() - before_out;
            consumed += read;

            if max_payload > 0 && output.len() as u64 > max_payload {
                return Err(DeflateError::SizeExceeded);
            }
            if status == Status::StreamEnd {
                return Ok(());
            }
            let drained = output.len() < output.capacity();
            if consumed == input.len() && drained {
                return Ok(());
            }
            if read == 0 && written == 0 {
                return Ok(());
            }
        }
    }
}

/// Send-direction stream state
struct DeflateStream {
    compress: Compress,
    window_bits: u8,
}

impl DeflateStream {
    fn new(level: u32, window_bits: u8) -> Self {
        Self {
            compress: Compress::new_with_window_bits(Compression::new(level), false, window_bits),
            window_bits,
        }
    }

    fn write(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), DeflateError> {
        let mut consumed = 0;
        loop {
            if output.capacity() - output.len() < 64 {
                output.reserve(CHUNK_SIZE.min(input.len() + 64));
            }
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            self.compress
                .compress_vec(&input[consumed..], output, FlushCompress::Sync)?;

            let read = (self.compress.total_in() - before_in) as usize;
            let written = self.compress.total_out() - before_out;
            consumed += read;

            let drained = output.len() < output.capacity();
            if consumed == input.len() && drained {
                return Ok(());
            }
            if read == 0 && written == 0 && drained {
                return Ok(());
            }
        }
    }
}

/// Per-connection permessage-deflate state
pub struct PerMessageDeflate {
    connection_id: Uuid,
    options: DeflateOptions,
    is_server: bool,
    max_payload: u64,
    limiter: Limiter,
    params: OnceLock<ExtensionParams>,
    inflate: Mutex<Option<InflateStream>>,
    deflate: Mutex<Option<DeflateStream>>,
    closed: AtomicBool,
}

impl PerMessageDeflate {
    /// Create the extension for one connection
    ///
    /// `max_payload` of 0 means unlimited. `limiter` should be the single
    /// process-wide compression limiter.
    pub fn new(options: DeflateOptions, is_server: bool, max_payload: u64, limiter: Limiter) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            options,
            is_server,
            max_payload,
            limiter,
            params: OnceLock::new(),
            inflate: Mutex::new(None),
            deflate: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier used to correlate log lines for this connection
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Whether this side is the server
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Negotiated parameters, once [`PerMessageDeflate::accept`] succeeded
    pub fn params(&self) -> Option<&ExtensionParams> {
        self.params.get()
    }

    /// Whether negotiation has completed
    pub fn is_negotiated(&self) -> bool {
        self.params.get().is_some()
    }

    /// Whether a payload of `len` bytes is worth compressing
    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.options.threshold
    }

    /// Build the client offer from local options
    pub fn offer(&self) -> ExtensionParams {
        let options = &self.options;
        let mut params = ExtensionParams {
            server_no_context_takeover: options.server_no_context_takeover == Some(true),
            client_no_context_takeover: options.client_no_context_takeover == Some(true),
            ..Default::default()
        };

        if let Some(WindowBitsPolicy::Bits(bits)) = options.server_max_window_bits {
            params.server_max_window_bits = Some(WindowBits::Bits(bits));
        }
        params.client_max_window_bits = match options.client_max_window_bits {
            Some(WindowBitsPolicy::Bits(bits)) => Some(WindowBits::Bits(bits)),
            Some(WindowBitsPolicy::Disallow) => None,
            Some(WindowBitsPolicy::Max) | None => Some(WindowBits::Max),
        };

        params
    }

    /// Negotiate parameters from the peer's offers (server) or response (client)
    ///
    /// The result is stored and stays fixed for the life of the connection.
    pub fn accept(&self, configurations: &[RawParams]) -> Result<ExtensionParams, NegotiationError> {
        if self.params.get().is_some() {
            return Err(NegotiationError::AlreadyNegotiated);
        }

        let normalized = normalize_params(configurations, self.is_server)?;
        let accepted = if self.is_server {
            self.accept_as_server(normalized)?
        } else {
            self.accept_as_client(normalized)?
        };

        self.settle(accepted, "permessage-deflate negotiated")
    }

    /// Take the parameters of an observed handshake response as they are
    ///
    /// Used by a passive observer decoding traffic between two other peers:
    /// the response is only validated, and none of the local policy in
    /// [`DeflateOptions`] is applied to it.
    pub fn adopt(&self, response: &RawParams) -> Result<ExtensionParams, NegotiationError> {
        if self.params.get().is_some() {
            return Err(NegotiationError::AlreadyNegotiated);
        }

        let adopted = normalize_params(std::slice::from_ref(response), false)?
            .into_iter()
            .next()
            .ok_or(NegotiationError::NoAcceptableOffer)?;
        self.settle(adopted, "permessage-deflate adopted")
    }

    fn settle(
        &self,
        params: ExtensionParams,
        message: &'static str,
    ) -> Result<ExtensionParams, NegotiationError> {
        debug!(
            connection_id = %self.connection_id,
            is_server = self.is_server,
            params = ?params,
            "{}",
            message
        );

        self.params
            .set(params.clone())
            .map_err(|_| NegotiationError::AlreadyNegotiated)?;
        Ok(params)
    }

    fn accept_as_server(
        &self,
        offers: Vec<ExtensionParams>,
    ) -> Result<ExtensionParams, NegotiationError> {
        let options = &self.options;

        let mut accepted = offers
            .into_iter()
            .find(|params| {
                let refuses_server_reset = options.server_no_context_takeover == Some(false)
                    && params.server_no_context_takeover;
                let server_window_conflict = match params.server_max_window_bits {
                    Some(offered) => match options.server_max_window_bits {
                        Some(WindowBitsPolicy::Disallow) => true,
                        Some(WindowBitsPolicy::Bits(local)) => {
                            offered.bits().map_or(false, |offered| local > offered)
                        }
                        _ => false,
                    },
                    None => false,
                };
                let missing_client_window = matches!(
                    options.client_max_window_bits,
                    Some(WindowBitsPolicy::Bits(_))
                ) && params.client_max_window_bits.is_none();

                !(refuses_server_reset || server_window_conflict || missing_client_window)
            })
            .ok_or(NegotiationError::NoAcceptableOffer)?;

        if options.server_no_context_takeover == Some(true) {
            accepted.server_no_context_takeover = true;
        }
        if options.client_no_context_takeover == Some(true) {
            accepted.client_no_context_takeover = true;
        }
        if let Some(WindowBitsPolicy::Bits(bits)) = options.server_max_window_bits {
            accepted.server_max_window_bits = Some(WindowBits::Bits(bits));
        }
        match options.client_max_window_bits {
            Some(WindowBitsPolicy::Bits(bits)) => {
                accepted.client_max_window_bits = Some(WindowBits::Bits(bits));
            }
            Some(WindowBitsPolicy::Disallow) => accepted.client_max_window_bits = None,
            _ => {
                if accepted.client_max_window_bits == Some(WindowBits::Max) {
                    accepted.client_max_window_bits = None;
                }
            }
        }

        Ok(accepted)
    }

    fn accept_as_client(
        &self,
        response: Vec<ExtensionParams>,
    ) -> Result<ExtensionParams, NegotiationError> {
        let options = &self.options;
        let mut params = response
            .into_iter()
            .next()
            .ok_or(NegotiationError::NoAcceptableOffer)?;

        if options.client_no_context_takeover == Some(false) && params.client_no_context_takeover
        {
            return Err(NegotiationError::UnexpectedParameter(
                "client_no_context_takeover".to_string(),
            ));
        }

        match params.client_max_window_bits {
            None => {
                if let Some(WindowBitsPolicy::Bits(bits)) = options.client_max_window_bits {
                    params.client_max_window_bits = Some(WindowBits::Bits(bits));
                }
            }
            Some(received) => {
                let too_large = match options.client_max_window_bits {
                    Some(WindowBitsPolicy::Disallow) => true,
                    Some(WindowBitsPolicy::Bits(requested)) => {
                        received.bits().map_or(true, |received| received > requested)
                    }
                    _ => false,
                };
                if too_large {
                    return Err(NegotiationError::UnexpectedParameter(
                        "client_max_window_bits".to_string(),
                    ));
                }
            }
        }

        Ok(params)
    }

    /// Decompress a payload through the shared limiter
    ///
    /// `fin` marks the last fragment of a message: the RFC 7692 trailer is
    /// appended before inflating, and the stream is dropped afterwards when
    /// the peer negotiated no-context-takeover. `callback` always fires,
    /// possibly on another thread.
    pub fn decompress<F>(self: &Arc<Self>, data: Bytes, fin: bool, callback: F)
    where
        F: FnOnce(Result<Bytes, DeflateError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        self.limiter.add(move |done| {
            let result = this.inflate_now(&data, fin);
            done.done();
            callback(result);
        });
    }

    /// Compress a payload through the shared limiter
    ///
    /// On `fin` the trailing `00 00 FF FF` of the sync flush is removed, and
    /// the compressor is reset when this side negotiated no-context-takeover.
    pub fn compress<F>(self: &Arc<Self>, data: Bytes, fin: bool, callback: F)
    where
        F: FnOnce(Result<Bytes, DeflateError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        self.limiter.add(move |done| {
            let result = this.deflate_now(&data, fin);
            done.done();
            callback(result);
        });
    }

    fn inflate_now(&self, data: &[u8], fin: bool) -> Result<Bytes, DeflateError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeflateError::Closed("inflate"));
        }
        let params = self.params.get().ok_or(DeflateError::NotNegotiated)?;
        let peer = if self.is_server {
            Endpoint::Client
        } else {
            Endpoint::Server
        };

        let mut slot = self.inflate.lock();
        let stream = slot.get_or_insert_with(|| {
            let window_bits = window_bits_for(params, peer);
            trace!(connection_id = %self.connection_id, window_bits, "creating inflate stream");
            InflateStream::new(window_bits)
        });

        let mut output = Vec::with_capacity(data.len().saturating_mul(2).min(CHUNK_SIZE * 4));
        let mut result = stream.write(data, &mut output, self.max_payload);
        if result.is_ok() && fin {
            result = stream.write(&TRAILER, &mut output, self.max_payload);
        }

        match result {
            Ok(()) => {
                if fin && no_context_takeover(params, peer) {
                    trace!(
                        connection_id = %self.connection_id,
                        window_bits = stream.window_bits,
                        "dropping inflate stream after message"
                    );
                    *slot = None;
                }
                Ok(Bytes::from(output))
            }
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "inflate failed");
                *slot = None;
                Err(e)
            }
        }
    }

    fn deflate_now(&self, data: &[u8], fin: bool) -> Result<Bytes, DeflateError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeflateError::Closed("deflate"));
        }
        let params = self.params.get().ok_or(DeflateError::NotNegotiated)?;
        let local = if self.is_server {
            Endpoint::Server
        } else {
            Endpoint::Client
        };

        let mut slot = self.deflate.lock();
        let level = self.options.level;
        let stream = slot.get_or_insert_with(|| {
            let window_bits = window_bits_for(params, local);
            trace!(connection_id = %self.connection_id, window_bits, "creating deflate stream");
            DeflateStream::new(level, window_bits)
        });

        let mut output = Vec::with_capacity(data.len() + 64);
        if let Err(e) = stream.write(data, &mut output) {
            warn!(connection_id = %self.connection_id, error = %e, "deflate failed");
            *slot = None;
            return Err(e);
        }

        if fin {
            if output.ends_with(&TRAILER) {
                output.truncate(output.len() - TRAILER.len());
            }
            if no_context_takeover(params, local) {
                trace!(
                    connection_id = %self.connection_id,
                    window_bits = stream.window_bits,
                    "resetting deflate stream after message"
                );
                stream.compress.reset();
            }
        }

        Ok(Bytes::from(output))
    }

    /// Tear down both streams
    ///
    /// Jobs still waiting in the limiter fail with
    /// [`DeflateError::Closed`] when they run.
    pub fn cleanup(&self) {
        self.closed.store(true, Ordering::Release);
        let had_inflate = self.inflate.lock().take().is_some();
        let had_deflate = self.deflate.lock().take().is_some();
        debug!(
            connection_id = %self.connection_id,
            had_inflate,
            had_deflate,
            "permessage-deflate cleaned up"
        );
    }
}

impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("connection_id", &self.connection_id)
            .field("is_server", &self.is_server)
            .field("max_payload", &self.max_payload)
            .field("params", &self.params.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ParamValue;
    use std::sync::mpsc;

    fn negotiated_pair(
        client_options: DeflateOptions,
        server_options: DeflateOptions,
        max_payload: u64,
    ) -> (Arc<PerMessageDeflate>, Arc<PerMessageDeflate>) {
        let limiter = Limiter::unbounded();
        let client = Arc::new(PerMessageDeflate::new(
            client_options,
            false,
            max_payload,
            limiter.clone(),
        ));
        let server = Arc::new(PerMessageDeflate::new(
            server_options,
            true,
            max_payload,
            limiter,
        ));

        let offer = client.offer();
        let accepted = server.accept(&[offer.to_raw()]).unwrap();
        client.accept(&[accepted.to_raw()]).unwrap();
        (client, server)
    }

    fn run(
        ext: &Arc<PerMessageDeflate>,
        data: &[u8],
        fin: bool,
        compress: bool,
    ) -> Result<Bytes, DeflateError> {
        let (tx, rx) = mpsc::channel();
        let data = Bytes::copy_from_slice(data);
        if compress {
            ext.compress(data, fin, move |r| tx.send(r).unwrap());
        } else {
            ext.decompress(data, fin, move |r| tx.send(r).unwrap());
        }
        rx.recv().unwrap()
    }

    #[test]
    fn test_offer_defaults_to_max_client_window() {
        let ext = PerMessageDeflate::new(DeflateOptions::default(), false, 0, Limiter::default());
        let offer = ext.offer();
        assert_eq!(offer.client_max_window_bits, Some(WindowBits::Max));
        assert!(!offer.server_no_context_takeover);
        assert_eq!(offer.server_max_window_bits, None);
    }

    #[test]
    fn test_server_window_max_policy_is_unset() {
        let options = DeflateOptions::default().with_server_max_window_bits(WindowBitsPolicy::Max);
        let client = PerMessageDeflate::new(options.clone(), false, 0, Limiter::default());
        assert_eq!(client.offer().server_max_window_bits, None);

        let server = PerMessageDeflate::new(options, true, 0, Limiter::default());
        let offer = RawParams::new().with_value("server_max_window_bits", "10");
        let accepted = server.accept(&[offer]).unwrap();
        assert_eq!(accepted.server_max_window_bits, Some(WindowBits::Bits(10)));
    }

    #[test]
    fn test_offer_disallowed_client_window() {
        let options =
            DeflateOptions::default().with_client_max_window_bits(WindowBitsPolicy::Disallow);
        let ext = PerMessageDeflate::new(options, false, 0, Limiter::default());
        assert_eq!(ext.offer().client_max_window_bits, None);
    }

    #[test]
    fn test_server_accepts_first_compatible_offer() {
        let options = DeflateOptions::default().with_server_no_context_takeover(false);
        let server = PerMessageDeflate::new(options, true, 0, Limiter::default());
        let offers = [
            RawParams::new().with_flag("server_no_context_takeover"),
            RawParams::new().with_value("server_max_window_bits", "11"),
        ];
        let accepted = server.accept(&offers).unwrap();
        assert_eq!(accepted.server_max_window_bits, Some(WindowBits::Bits(11)));
        assert!(!accepted.server_no_context_takeover);
        assert_eq!(server.params(), Some(&accepted));
    }

    #[test]
    fn test_server_rejects_all_offers() {
        let options =
            DeflateOptions::default().with_server_max_window_bits(WindowBitsPolicy::Disallow);
        let server = PerMessageDeflate::new(options, true, 0, Limiter::default());
        let offers = [RawParams::new().with_value("server_max_window_bits", "10")];
        assert_eq!(
            server.accept(&offers).unwrap_err(),
            NegotiationError::NoAcceptableOffer
        );
        assert!(!server.is_negotiated());
    }

    #[test]
    fn test_server_rejects_stricter_window_than_policy() {
        let options =
            DeflateOptions::default().with_server_max_window_bits(WindowBitsPolicy::Bits(12));
        let server = PerMessageDeflate::new(options, true, 0, Limiter::default());
        let offers = [RawParams::new().with_value("server_max_window_bits", "10")];
        assert!(server.accept(&offers).is_err());
    }

    #[test]
    fn test_server_requires_client_window_when_configured() {
        let options =
            DeflateOptions::default().with_client_max_window_bits(WindowBitsPolicy::Bits(10));
        let server = PerMessageDeflate::new(options.clone(), true, 0, Limiter::default());
        assert!(server.accept(&[RawParams::new()]).is_err());

        let server = PerMessageDeflate::new(options, true, 0, Limiter::default());
        let accepted = server
            .accept(&[RawParams::new().with_flag("client_max_window_bits")])
            .unwrap();
        assert_eq!(accepted.client_max_window_bits, Some(WindowBits::Bits(10)));
    }

    #[test]
    fn test_server_drops_bare_client_window() {
        let server = PerMessageDeflate::new(DeflateOptions::default(), true, 0, Limiter::default());
        let accepted = server
            .accept(&[RawParams::new().with_flag("client_max_window_bits")])
            .unwrap();
        assert_eq!(accepted.client_max_window_bits, None);
    }

    #[test]
    fn test_client_rejects_unexpected_parameters() {
        let options = DeflateOptions::default().with_client_no_context_takeover(false);
        let client = PerMessageDeflate::new(options, false, 0, Limiter::default());
        let response = [RawParams::new().with_flag("client_no_context_takeover")];
        assert!(client.accept(&response).is_err());

        let options =
            DeflateOptions::default().with_client_max_window_bits(WindowBitsPolicy::Bits(10));
        let client = PerMessageDeflate::new(options, false, 0, Limiter::default());
        let response = [RawParams::new().with_value("client_max_window_bits", "12")];
        assert_eq!(
            client.accept(&response).unwrap_err(),
            NegotiationError::UnexpectedParameter("client_max_window_bits".to_string())
        );
    }

    #[test]
    fn test_client_fills_in_requested_window() {
        let options =
            DeflateOptions::default().with_client_max_window_bits(WindowBitsPolicy::Bits(10));
        let client = PerMessageDeflate::new(options, false, 0, Limiter::default());
        let params = client.accept(&[RawParams::new()]).unwrap();
        assert_eq!(params.client_max_window_bits, Some(WindowBits::Bits(10)));
    }

    #[test]
    fn test_accept_only_once() {
        let server = PerMessageDeflate::new(DeflateOptions::default(), true, 0, Limiter::default());
        server.accept(&[RawParams::new()]).unwrap();
        assert_eq!(
            server.accept(&[RawParams::new()]).unwrap_err(),
            NegotiationError::AlreadyNegotiated
        );
    }

    #[test]
    fn test_adopt_ignores_local_policy() {
        let options = DeflateOptions::default()
            .with_client_no_context_takeover(true)
            .with_server_no_context_takeover(true)
            .with_client_max_window_bits(WindowBitsPolicy::Bits(9))
            .with_server_max_window_bits(WindowBitsPolicy::Disallow);
        let response = RawParams::new().with_value("server_max_window_bits", "12");

        for is_server in [false, true] {
            let ext = PerMessageDeflate::new(options.clone(), is_server, 0, Limiter::default());
            let params = ext.adopt(&response).unwrap();
            assert_eq!(
                params,
                ExtensionParams {
                    server_max_window_bits: Some(WindowBits::Bits(12)),
                    ..Default::default()
                }
            );
            assert_eq!(
                ext.adopt(&response).unwrap_err(),
                NegotiationError::AlreadyNegotiated
            );
        }
    }

    #[test]
    fn test_adopt_rejects_bare_client_window() {
        let ext = PerMessageDeflate::new(DeflateOptions::default(), true, 0, Limiter::default());
        let response = RawParams::new().with_flag("client_max_window_bits");
        assert!(matches!(
            ext.adopt(&response),
            Err(NegotiationError::InvalidValue { .. })
        ));
        assert!(!ext.is_negotiated());
    }

    #[test]
    fn test_adopted_pair_keeps_context() {
        let strict = DeflateOptions::default().with_client_no_context_takeover(true);
        let (client, _) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 0);
        let observer = Arc::new(PerMessageDeflate::new(strict, true, 0, Limiter::unbounded()));
        observer.adopt(&RawParams::new()).unwrap();

        for _ in 0..3 {
            let payload = b"repeat repeat repeat repeat";
            let compressed = run(&client, payload, true, true).unwrap();
            let restored = run(&observer, &compressed, true, false).unwrap();
            assert_eq!(&restored[..], &payload[..]);
        }
    }

    #[test]
    fn test_accept_rejects_invalid_raw_value() {
        let server = PerMessageDeflate::new(DeflateOptions::default(), true, 0, Limiter::default());
        let mut raw = RawParams::new();
        raw.push("server_max_window_bits", ParamValue::Token("99".to_string()));
        assert!(matches!(
            server.accept(&[raw]),
            Err(NegotiationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_roundtrip() {
        let (client, server) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 0);
        let payload = b"Hello, Hello, Hello, compressed world! ".repeat(20);

        let compressed = run(&client, &payload, true, true).unwrap();
        assert!(compressed.len() < payload.len());
        assert!(!compressed.ends_with(&TRAILER));

        let restored = run(&server, &compressed, true, false).unwrap();
        assert_eq!(&restored[..], &payload[..]);
    }

    #[test]
    fn test_roundtrip_with_context_takeover() {
        let (client, server) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 0);
        for i in 0..5 {
            let payload = format!("message number {} with shared context", i).into_bytes();
            let compressed = run(&client, &payload, true, true).unwrap();
            let restored = run(&server, &compressed, true, false).unwrap();
            assert_eq!(&restored[..], &payload[..]);
        }
    }

    #[test]
    fn test_roundtrip_no_context_takeover_small_windows() {
        let client_options = DeflateOptions::default()
            .with_client_no_context_takeover(true)
            .with_client_max_window_bits(WindowBitsPolicy::Bits(8));
        let server_options = DeflateOptions::default()
            .with_server_no_context_takeover(true)
            .with_server_max_window_bits(WindowBitsPolicy::Bits(9));
        let (client, server) = negotiated_pair(client_options, server_options, 0);

        for _ in 0..3 {
            let payload = vec![0x5au8; 4096];
            let compressed = run(&server, &payload, true, true).unwrap();
            let restored = run(&client, &compressed, true, false).unwrap();
            assert_eq!(&restored[..], &payload[..]);

            let compressed = run(&client, &payload, true, true).unwrap();
            let restored = run(&server, &compressed, true, false).unwrap();
            assert_eq!(&restored[..], &payload[..]);
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let (client, server) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 0);
        let compressed = run(&client, b"", true, true).unwrap();
        let restored = run(&server, &compressed, true, false).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_size_exceeded() {
        let (client, server) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 100);
        let payload = vec![b'a'; 10_000];
        let compressed = run(&client, &payload, true, true).unwrap();
        assert_eq!(
            run(&server, &compressed, true, false).unwrap_err(),
            DeflateError::SizeExceeded
        );
    }

    #[test]
    fn test_garbage_input_fails() {
        let (_client, server) =
            negotiated_pair(DeflateOptions::default(), DeflateOptions::default(), 0);
        let result = run(&server, &[0xff, 0xff, 0xff, 0xff, 0xff], true, false);
        assert!(matches!(result, Err(DeflateError::Inflate(_))));
    }

    #[test]
    fn test_not_negotiated() {
        let ext = Arc::new(PerMessageDeflate::new(
            DeflateOptions::default(),
            true,
            0,
            Limiter::default(),
        ));
        assert_eq!(
            run(&ext, b"abc", true, false).unwrap_err(),
            DeflateError::NotNegotiated
        );
    }

    #[test]
    fn test_cleanup_fails_queued_jobs() {
        let limiter = Limiter::new(1);
        let server = Arc::new(PerMessageDeflate::new(
            DeflateOptions::default(),
            true,
            0,
            limiter.clone(),
        ));
        server.accept(&[RawParams::new()]).unwrap();

        // occupy the only slot
        let (hold_tx, hold_rx) = mpsc::channel();
        limiter.add(move |done| hold_tx.send(done).unwrap());
        let held = hold_rx.recv().unwrap();

        let (tx, rx) = mpsc::channel();
        server.decompress(Bytes::from_static(b"\x00"), true, move |r| tx.send(r).unwrap());
        assert!(rx.try_recv().is_err());

        server.cleanup();
        held.done();
        assert_eq!(rx.recv().unwrap().unwrap_err(), DeflateError::Closed("inflate"));
    }

    #[test]
    fn test_threshold() {
        let ext = PerMessageDeflate::new(
            DeflateOptions::default().with_threshold(10),
            false,
            0,
            Limiter::default(),
        );
        assert!(!ext.should_compress(9));
        assert!(ext.should_compress(10));
    }
}
