//! Extension parameter model and `Sec-WebSocket-Extensions` header codec

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NegotiationError;

/// Lowest window size accepted in negotiation
pub const MIN_WINDOW_BITS: u8 = 8;

/// Highest window size accepted in negotiation
pub const MAX_WINDOW_BITS: u8 = 15;

/// A single raw parameter value as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Parameter without `=value`, meaning boolean true
    Flag,
    /// Parameter with an explicit value
    Token(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag => write!(f, "true"),
            ParamValue::Token(value) => write!(f, "{}", value),
        }
    }
}

/// Un-validated parameters of one extension offer, in wire order
///
/// Repeated keys are kept together so that normalization can reject them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawParams {
    entries: Vec<(String, Vec<ParamValue>)>,
}

impl RawParams {
    /// Create an empty parameter list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `key`
    pub fn push(&mut self, key: impl Into<String>, value: ParamValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Builder form of [`RawParams::push`] for a bare flag
    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.push(key, ParamValue::Flag);
        self
    }

    /// Builder form of [`RawParams::push`] for a valued parameter
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, ParamValue::Token(value.into()));
        self
    }

    /// Iterate over keys and their values
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ParamValue])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Whether no parameters are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A window-bits parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowBits {
    /// Bare `client_max_window_bits`: the peer may pick any size
    Max,
    /// Explicit size in 8..=15
    Bits(u8),
}

impl WindowBits {
    /// Explicit size, if one was given
    pub fn bits(self) -> Option<u8> {
        match self {
            WindowBits::Max => None,
            WindowBits::Bits(bits) => Some(bits),
        }
    }
}

/// Validated permessage-deflate parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionParams {
    /// Server resets its compressor after every message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after every message
    pub client_no_context_takeover: bool,
    /// Server's LZ77 window size
    pub server_max_window_bits: Option<WindowBits>,
    /// Client's LZ77 window size
    pub client_max_window_bits: Option<WindowBits>,
}

impl ExtensionParams {
    /// Convert back into raw wire parameters
    pub fn to_raw(&self) -> RawParams {
        let mut raw = RawParams::new();
        if self.server_no_context_takeover {
            raw.push("server_no_context_takeover", ParamValue::Flag);
        }
        if self.client_no_context_takeover {
            raw.push("client_no_context_takeover", ParamValue::Flag);
        }
        for (key, value) in [
            ("server_max_window_bits", self.server_max_window_bits),
            ("client_max_window_bits", self.client_max_window_bits),
        ] {
            match value {
                Some(WindowBits::Max) => raw.push(key, ParamValue::Flag),
                Some(WindowBits::Bits(bits)) => raw.push(key, ParamValue::Token(bits.to_string())),
                None => {}
            }
        }
        raw
    }
}

/// Validate raw offers into typed parameters
///
/// Each key must carry exactly one value. Window sizes must be integers in
/// 8..=15; a bare `client_max_window_bits` is only legal when the local
/// side is the server. The no-context-takeover keys must be bare flags.
pub fn normalize_params(
    configurations: &[RawParams],
    is_server: bool,
) -> Result<Vec<ExtensionParams>, NegotiationError> {
    configurations
        .iter()
        .map(|raw| normalize_one(raw, is_server))
        .collect()
}

fn normalize_one(raw: &RawParams, is_server: bool) -> Result<ExtensionParams, NegotiationError> {
    let mut params = ExtensionParams::default();

    for (key, values) in raw.iter() {
        let value = match values {
            [value] => value,
            _ => return Err(NegotiationError::DuplicateParameter(key.to_string())),
        };

        match key {
            "client_max_window_bits" => {
                params.client_max_window_bits = Some(match value {
                    ParamValue::Flag if is_server => WindowBits::Max,
                    _ => WindowBits::Bits(parse_window_bits(key, value)?),
                });
            }
            "server_max_window_bits" => {
                params.server_max_window_bits =
                    Some(WindowBits::Bits(parse_window_bits(key, value)?));
            }
            "client_no_context_takeover" | "server_no_context_takeover" => {
                if *value != ParamValue::Flag {
                    return Err(invalid_value(key, value));
                }
                if key == "client_no_context_takeover" {
                    params.client_no_context_takeover = true;
                } else {
                    params.server_no_context_takeover = true;
                }
            }
            _ => return Err(NegotiationError::UnknownParameter(key.to_string())),
        }
    }

    Ok(params)
}

fn parse_window_bits(key: &str, value: &ParamValue) -> Result<u8, NegotiationError> {
    match value {
        ParamValue::Token(text) => text
            .parse::<u8>()
            .ok()
            .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
            .ok_or_else(|| invalid_value(key, value)),
        ParamValue::Flag => Err(invalid_value(key, value)),
    }
}

fn invalid_value(key: &str, value: &ParamValue) -> NegotiationError {
    NegotiationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// One extension entry of a `Sec-WebSocket-Extensions` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionOffer {
    /// Extension token, e.g. `permessage-deflate`
    pub name: String,
    /// Its parameters
    pub params: RawParams,
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

fn skip_whitespace(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && (bytes[*pos] == b' ' || bytes[*pos] == b'\t') {
        *pos += 1;
    }
}

fn read_token(header: &str, pos: &mut usize) -> Result<String, NegotiationError> {
    let bytes = header.as_bytes();
    let start = *pos;
    while *pos < bytes.len() && is_token_char(bytes[*pos]) {
        *pos += 1;
    }
    if *pos == start {
        return Err(NegotiationError::InvalidHeader(start));
    }
    Ok(header[start..*pos].to_string())
}

fn read_quoted(header: &str, pos: &mut usize) -> Result<String, NegotiationError> {
    let bytes = header.as_bytes();
    let start = *pos;
    // opening quote
    *pos += 1;
    let mut value = String::new();
    while *pos < bytes.len() {
        match bytes[*pos] {
            b'"' => {
                *pos += 1;
                if value.is_empty() || !value.bytes().all(is_token_char) {
                    return Err(NegotiationError::InvalidHeader(start));
                }
                return Ok(value);
            }
            b'\\' if *pos + 1 < bytes.len() => {
                value.push(char::from(bytes[*pos + 1]));
                *pos += 2;
            }
            byte => {
                value.push(char::from(byte));
                *pos += 1;
            }
        }
    }
    Err(NegotiationError::InvalidHeader(bytes.len()))
}

/// Parse a `Sec-WebSocket-Extensions` header value
///
/// ```
/// use ws_engine::extension::parse_extensions;
///
/// let offers = parse_extensions("permessage-deflate; client_max_window_bits").unwrap();
/// assert_eq!(offers[0].name, "permessage-deflate");
/// ```
pub fn parse_extensions(header: &str) -> Result<Vec<ExtensionOffer>, NegotiationError> {
    let bytes = header.as_bytes();
    let mut pos = 0;
    let mut offers = Vec::new();

    loop {
        skip_whitespace(bytes, &mut pos);
        let name = read_token(header, &mut pos)?;
        let mut params = RawParams::new();
        skip_whitespace(bytes, &mut pos);

        while pos < bytes.len() && bytes[pos] == b';' {
            pos += 1;
            skip_whitespace(bytes, &mut pos);
            let key = read_token(header, &mut pos)?;
            skip_whitespace(bytes, &mut pos);

            let value = if pos < bytes.len() && bytes[pos] == b'=' {
                pos += 1;
                skip_whitespace(bytes, &mut pos);
                if pos < bytes.len() && bytes[pos] == b'"' {
                    ParamValue::Token(read_quoted(header, &mut pos)?)
                } else {
                    ParamValue::Token(read_token(header, &mut pos)?)
                }
            } else {
                ParamValue::Flag
            };
            params.push(key, value);
            skip_whitespace(bytes, &mut pos);
        }

        offers.push(ExtensionOffer { name, params });

        if pos == bytes.len() {
            return Ok(offers);
        }
        if bytes[pos] != b',' {
            return Err(NegotiationError::InvalidHeader(pos));
        }
        pos += 1;
    }
}

/// Render extension offers as a `Sec-WebSocket-Extensions` header value
pub fn format_extensions(offers: &[ExtensionOffer]) -> String {
    offers
        .iter()
        .map(|offer| {
            let mut parts = vec![offer.name.clone()];
            for (key, values) in offer.params.iter() {
                for value in values {
                    match value {
                        ParamValue::Flag => parts.push(key.to_string()),
                        ParamValue::Token(v) => parts.push(format!("{}={}", key, v)),
                    }
                }
            }
            parts.join("; ")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
