//! Byte buffer primitives: concatenation, masking and representation changes

use bytes::{Bytes, BytesMut};

use crate::validation::ObjectShape;

/// Merge a list of chunks into a single buffer
///
/// Zero or one chunk is returned without copying. Otherwise exactly
/// `total_length` bytes are allocated; if the chunks fall short the result is
/// truncated to what was actually copied.
pub fn concat(list: &[Bytes], total_length: usize) -> Bytes {
    match list {
        [] => Bytes::new(),
        [only] => only.clone(),
        _ => {
            let mut target = BytesMut::with_capacity(total_length);
            for buf in list {
                let remaining = total_length - target.len();
                if remaining == 0 {
                    break;
                }
                let take = buf.len().min(remaining);
                target.extend_from_slice(&buf[..take]);
            }
            target.freeze()
        }
    }
}

/// XOR `length` bytes of `source` with `mask` into `output[offset..]`
///
/// # Panics
///
/// Panics if `source` is shorter than `length` or `output` cannot hold
/// `offset + length` bytes.
pub fn mask(source: &[u8], mask: [u8; 4], output: &mut [u8], offset: usize, length: usize) {
    let target = &mut output[offset..offset + length];
    for (i, (out, byte)) in target.iter_mut().zip(&source[..length]).enumerate() {
        *out = byte ^ mask[i & 3];
    }
}

/// XOR `buffer` with `mask` in place
pub fn unmask(buffer: &mut [u8], mask: [u8; 4]) {
    let mut chunks = buffer.chunks_exact_mut(4);
    let word = u32::from_ne_bytes(mask);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i];
    }
}

/// Binary inputs accepted by [`to_buffer`]
#[derive(Debug, Clone)]
pub enum BinaryData<'a> {
    /// A shared, reference-counted buffer
    Buffer(Bytes),
    /// A growable array handed over by value
    ArrayBuffer(Vec<u8>),
    /// A view into storage owned elsewhere
    View(&'a [u8]),
    /// Text, encoded as UTF-8
    Text(&'a str),
}

impl From<Bytes> for BinaryData<'_> {
    fn from(value: Bytes) -> Self {
        BinaryData::Buffer(value)
    }
}

impl From<Vec<u8>> for BinaryData<'_> {
    fn from(value: Vec<u8>) -> Self {
        BinaryData::ArrayBuffer(value)
    }
}

impl<'a> From<&'a [u8]> for BinaryData<'a> {
    fn from(value: &'a [u8]) -> Self {
        BinaryData::View(value)
    }
}

impl<'a> From<&'a str> for BinaryData<'a> {
    fn from(value: &'a str) -> Self {
        BinaryData::Text(value)
    }
}

/// Whether a converted buffer may be mutated without affecting anyone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Storage is shared with the caller; copy before writing
    Shared,
    /// Storage belongs to the result alone
    Owned,
}

/// Result of [`to_buffer`]
#[derive(Debug, Clone)]
pub struct Converted {
    /// The converted bytes
    pub data: Bytes,
    /// Ownership of the storage behind `data`
    pub ownership: Ownership,
}

/// Convert any supported binary input into a [`Bytes`] buffer
///
/// Buffers and arrays are adopted without copying; views and text are
/// copied into fresh storage.
pub fn to_buffer<'a>(data: impl Into<BinaryData<'a>>) -> Converted {
    match data.into() {
        BinaryData::Buffer(data) => Converted {
            data,
            ownership: Ownership::Shared,
        },
        BinaryData::ArrayBuffer(vec) => Converted {
            data: Bytes::from(vec),
            ownership: Ownership::Owned,
        },
        BinaryData::View(slice) => Converted {
            data: Bytes::copy_from_slice(slice),
            ownership: Ownership::Owned,
        },
        BinaryData::Text(text) => Converted {
            data: Bytes::copy_from_slice(text.as_bytes()),
            ownership: Ownership::Owned,
        },
    }
}

/// Convert a buffer into a standalone byte array
///
/// Reuses the allocation when `buf` is the sole owner of its whole backing
/// storage, and copies when it is a slice of a larger or shared allocation.
pub fn to_array_buffer(buf: Bytes) -> Vec<u8> {
    Vec::from(buf)
}

/// An immutable binary large object assembled from message fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob {
    parts: Vec<Bytes>,
    size: usize,
    mime_type: String,
}

impl Blob {
    /// Create a blob from its parts
    pub fn new(parts: Vec<Bytes>, mime_type: impl Into<String>) -> Self {
        let size = parts.iter().map(Bytes::len).sum();
        Self {
            parts,
            size,
            mime_type: mime_type.into(),
        }
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// MIME type, empty when unknown
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Read the whole blob into one buffer
    pub fn array_buffer(&self) -> Bytes {
        concat(&self.parts, self.size)
    }

    /// Stream the blob part by part
    pub fn stream(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.parts.iter()
    }
}

impl ObjectShape for Blob {
    fn has_method(&self, name: &str) -> bool {
        matches!(name, "arrayBuffer" | "stream" | "slice" | "text")
    }

    fn has_property(&self, name: &str) -> bool {
        matches!(name, "type" | "size")
    }

    fn to_string_tag(&self) -> Option<&str> {
        Some("Blob")
    }
}
