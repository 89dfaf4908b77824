//! HTTP/2 frame layout (RFC 9113 Section 4 and 6).
//!
//! Fixed 9-byte frame header, the small fixed-size payload records the
//! dispatch loop decodes (SETTINGS entries, RST_STREAM, PRIORITY,
//! WINDOW_UPDATE, PING, GOAWAY), padding removal for DATA and HEADERS, and
//! builders for every frame the writer emits.

use bytes::Bytes;

use crate::error::{ErrorCode, H2Error};

/// HTTP/2 frame types (RFC 9113 Section 6)
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    /// Shares its bit with END_STREAM; only meaningful on SETTINGS and PING.
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Size of one SETTINGS parameter record (u16 id + u32 value).
pub const SETTING_ENTRY_SIZE: usize = 6;

pub const RST_STREAM_PAYLOAD_SIZE: usize = 4;
pub const PRIORITY_PAYLOAD_SIZE: usize = 5;
pub const WINDOW_UPDATE_PAYLOAD_SIZE: usize = 4;
pub const PING_PAYLOAD_SIZE: usize = 8;
pub const GOAWAY_MIN_PAYLOAD_SIZE: usize = 8;

/// Maximum accumulated header block size (256 KB).
/// Bounds memory spent on a HEADERS + CONTINUATION sequence.
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// The HTTP/2 client connection preface (24 bytes)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,    // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32, // 31 bits (high bit reserved)
}

impl FrameHeader {
    pub fn new(frame_type: u8, flags: u8, stream_id: u32, length: u32) -> Self {
        Self {
            length,
            frame_type,
            flags,
            stream_id,
        }
    }

    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        let head: &[u8; FRAME_HEADER_SIZE] = data.get(..FRAME_HEADER_SIZE)?.try_into().ok()?;
        Some(Self::decode(head))
    }

    pub fn decode(data: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let frame_type = data[3];
        let flags = data[4];
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & STREAM_ID_MASK;

        Self {
            length,
            frame_type,
            flags,
            stream_id,
        }
    }

    /// Serialize into the 9-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let id = (self.stream_id & STREAM_ID_MASK).to_be_bytes();
        [
            (self.length >> 16) as u8,
            (self.length >> 8) as u8,
            self.length as u8,
            self.frame_type,
            self.flags,
            id[0],
            id[1],
            id[2],
            id[3],
        ]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.has_flag(flags::END_STREAM)
    }

    pub fn is_end_headers(&self) -> bool {
        self.has_flag(flags::END_HEADERS)
    }

    pub fn is_ack(&self) -> bool {
        self.has_flag(flags::ACK)
    }
}

/// Human readable frame type name, used in trace output.
pub fn frame_type_name(frame_type: u8) -> &'static str {
    match frame_type {
        frame_type::DATA => "DATA",
        frame_type::HEADERS => "HEADERS",
        frame_type::PRIORITY => "PRIORITY",
        frame_type::RST_STREAM => "RST_STREAM",
        frame_type::SETTINGS => "SETTINGS",
        frame_type::PUSH_PROMISE => "PUSH_PROMISE",
        frame_type::PING => "PING",
        frame_type::GOAWAY => "GOAWAY",
        frame_type::WINDOW_UPDATE => "WINDOW_UPDATE",
        frame_type::CONTINUATION => "CONTINUATION",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// Payload records
// ============================================================================

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Parse SETTINGS entries: each is 6 bytes (u16 id + u32 value).
/// The caller has already checked that the length is a multiple of 6.
pub fn decode_settings(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(SETTING_ENTRY_SIZE)
        .map(|entry| (u16::from_be_bytes([entry[0], entry[1]]), read_u32(&entry[2..])))
        .collect()
}

pub fn decode_rst_stream(payload: &[u8]) -> ErrorCode {
    ErrorCode::from(read_u32(payload))
}

/// WINDOW_UPDATE increment with the reserved bit cleared.
pub fn decode_window_update(payload: &[u8]) -> u32 {
    read_u32(payload) & STREAM_ID_MASK
}

/// PRIORITY payload. Parsed but never acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

impl Priority {
    pub fn decode(payload: &[u8]) -> Self {
        let raw = read_u32(payload);
        Self {
            exclusive: raw & !STREAM_ID_MASK != 0,
            stream_dependency: raw & STREAM_ID_MASK,
            weight: payload[4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAway {
    /// The caller has already checked the payload holds at least 8 bytes.
    pub fn decode(payload: &[u8]) -> Self {
        Self {
            last_stream_id: read_u32(payload) & STREAM_ID_MASK,
            error_code: ErrorCode::from(read_u32(&payload[4..])),
            debug_data: Bytes::copy_from_slice(&payload[GOAWAY_MIN_PAYLOAD_SIZE..]),
        }
    }
}

// ============================================================================
// Padding
// ============================================================================

/// Strip the PADDED framing from a DATA payload.
pub fn data_payload<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<&'a [u8], H2Error> {
    if !header.has_flag(flags::PADDED) {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::protocol("PADDED DATA frame with no payload"));
    }
    let pad_length = payload[0] as usize;
    if pad_length >= payload.len() {
        return Err(H2Error::protocol("Invalid padding length in DATA frame"));
    }
    Ok(&payload[1..payload.len() - pad_length])
}

/// Strip PADDED and PRIORITY framing from a HEADERS payload, leaving the
/// header block fragment.
pub fn headers_payload<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<&'a [u8], H2Error> {
    let mut offset = 0;
    let mut end = payload.len();

    if header.has_flag(flags::PADDED) {
        if payload.is_empty() {
            return Err(H2Error::protocol("PADDED HEADERS frame with no payload"));
        }
        let pad_length = payload[0] as usize;
        offset = 1;
        if pad_length > payload.len() - offset {
            return Err(H2Error::protocol("Invalid padding length in HEADERS frame"));
        }
        end = payload.len() - pad_length;
    }

    if header.has_flag(flags::PRIORITY) {
        if end - offset < PRIORITY_PAYLOAD_SIZE {
            return Err(H2Error::protocol("PRIORITY HEADERS frame with insufficient data"));
        }
        offset += PRIORITY_PAYLOAD_SIZE;
    }

    Ok(&payload[offset..end])
}

// ============================================================================
// Frame builders
// ============================================================================

fn frame_with_payload(header: FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

/// SETTINGS frame carrying the given (identifier, value) pairs.
pub fn settings(params: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(params.len() * SETTING_ENTRY_SIZE);
    for (id, value) in params {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    let header = FrameHeader::new(frame_type::SETTINGS, 0, 0, payload.len() as u32);
    frame_with_payload(header, &payload)
}

pub fn settings_ack() -> Vec<u8> {
    FrameHeader::new(frame_type::SETTINGS, flags::ACK, 0, 0).encode().to_vec()
}

pub fn ping_ack(data: [u8; PING_PAYLOAD_SIZE]) -> Vec<u8> {
    let header = FrameHeader::new(frame_type::PING, flags::ACK, 0, PING_PAYLOAD_SIZE as u32);
    frame_with_payload(header, &data)
}

/// WINDOW_UPDATE frame; stream_id=0 updates the connection-level window.
pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
    let header = FrameHeader::new(
        frame_type::WINDOW_UPDATE,
        0,
        stream_id,
        WINDOW_UPDATE_PAYLOAD_SIZE as u32,
    );
    frame_with_payload(header, &(increment & STREAM_ID_MASK).to_be_bytes())
}

pub fn rst_stream(stream_id: u32, code: ErrorCode) -> Vec<u8> {
    let header = FrameHeader::new(
        frame_type::RST_STREAM,
        0,
        stream_id,
        RST_STREAM_PAYLOAD_SIZE as u32,
    );
    frame_with_payload(header, &code.as_u32().to_be_bytes())
}

pub fn goaway(last_stream_id: u32, code: ErrorCode) -> Vec<u8> {
    let header = FrameHeader::new(frame_type::GOAWAY, 0, 0, GOAWAY_MIN_PAYLOAD_SIZE as u32);
    let mut payload = [0u8; GOAWAY_MIN_PAYLOAD_SIZE];
    payload[..4].copy_from_slice(&(last_stream_id & STREAM_ID_MASK).to_be_bytes());
    payload[4..].copy_from_slice(&code.as_u32().to_be_bytes());
    frame_with_payload(header, &payload)
}

/// Split an encoded header block into one HEADERS frame followed by as many
/// CONTINUATION frames as `max_frame_size` requires.
pub fn header_block_frames(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() + FRAME_HEADER_SIZE);
    let mut chunks = block.chunks(max_frame_size.max(1)).peekable();
    let mut first = true;

    if chunks.peek().is_none() {
        let mut flags_byte = flags::END_HEADERS;
        if end_stream {
            flags_byte |= flags::END_STREAM;
        }
        out.extend_from_slice(&FrameHeader::new(frame_type::HEADERS, flags_byte, stream_id, 0).encode());
        return out;
    }

    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let (kind, mut flags_byte) = if first {
            (frame_type::HEADERS, if end_stream { flags::END_STREAM } else { 0 })
        } else {
            (frame_type::CONTINUATION, 0)
        };
        if last {
            flags_byte |= flags::END_HEADERS;
        }
        let header = FrameHeader::new(kind, flags_byte, stream_id, chunk.len() as u32);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(chunk);
        first = false;
    }
    out
}

/// Header of a DATA frame; the payload is written separately.
pub fn data_header(stream_id: u32, length: usize, end_stream: bool) -> [u8; FRAME_HEADER_SIZE] {
    let flags_byte = if end_stream { flags::END_STREAM } else { 0 };
    FrameHeader::new(frame_type::DATA, flags_byte, stream_id, length as u32).encode()
}
