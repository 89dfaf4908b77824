//! HPACK: Header Compression for HTTP/2 (RFC 7541)
//!
//! Thin wrapper around `fluke-hpack`. The decoder belongs to the dispatch
//! loop and the encoder to the outbound writer, so each side's dynamic table
//! is only ever touched in wire order.

use crate::error::{ErrorCode, H2Error};

/// Per-entry overhead counted by SETTINGS_MAX_HEADER_LIST_SIZE (RFC 9113 §6.5.2).
const HEADER_ENTRY_OVERHEAD: usize = 32;

/// A decoded HTTP/2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Header {
    pub name: String,
    pub value: String,
}

impl H2Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Size of a header list as SETTINGS_MAX_HEADER_LIST_SIZE measures it.
pub fn header_list_size(headers: &[H2Header]) -> usize {
    headers
        .iter()
        .map(|h| h.name.len() + h.value.len() + HEADER_ENTRY_OVERHEAD)
        .sum()
}

/// HPACK decoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Decoder` which maintains dynamic table state per-connection.
pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish()
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    /// Decode a complete header block.
    ///
    /// A malformed block leaves the dynamic table in an unknown state, so the
    /// failure is a connection-level COMPRESSION_ERROR.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<H2Header>, H2Error> {
        let pairs = self.inner.decode(block).map_err(|e| {
            H2Error::connection(
                ErrorCode::CompressionError,
                format!("HPACK decode error: {:?}", e),
            )
        })?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| {
                H2Header::new(
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }
}

/// HPACK encoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Encoder` which maintains dynamic table state per-connection.
pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish()
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    /// Encode headers into an HPACK header block.
    pub fn encode(&mut self, headers: &[H2Header]) -> Vec<u8> {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()))
            .collect();
        self.inner.encode(pairs)
    }
}
