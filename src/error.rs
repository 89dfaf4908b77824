//! Error types for the HTTP/2 connection engine.
//!
//! Two layers live here:
//! - [`H2Error`] is the tagged protocol error produced by frame handlers.
//!   Its `stream_id` decides the outcome: `0` terminates the connection with
//!   GOAWAY, anything else resets just that stream.
//! - [`Error`] is what the public API returns (I/O, closed connection,
//!   reset stream, bad configuration).

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// HTTP/2 error codes (RFC 9113 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<u32> for ErrorCode {
    /// Unknown codes must not trigger special behavior, so they collapse
    /// into `InternalError`.
    fn from(value: u32) -> Self {
        match value {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// A protocol error scoped either to the connection (`stream_id == 0`) or to
/// a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} on stream {stream_id}: {message}")]
pub struct H2Error {
    pub stream_id: u32,
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
}

impl H2Error {
    /// A connection error: the connection is torn down with GOAWAY.
    pub fn connection(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            stream_id: 0,
            code,
            message: message.into(),
        }
    }

    /// A stream error: only `stream_id` is reset.
    pub fn stream(stream_id: u32, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        debug_assert!(stream_id != 0, "stream errors need a non-zero stream id");
        Self {
            stream_id,
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self::connection(ErrorCode::ProtocolError, message)
    }

    pub fn frame_size(message: impl Into<Cow<'static, str>>) -> Self {
        Self::connection(ErrorCode::FrameSizeError, message)
    }

    pub fn is_connection_error(&self) -> bool {
        self.stream_id == 0
    }
}

/// Main error type for the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer has been closed; no further frames can be sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The stream was reset (by us or by the peer).
    #[error("Stream {stream_id} reset with {code}")]
    StreamReset { stream_id: u32, code: ErrorCode },

    /// The operation is not allowed in the stream's current state.
    #[error("Stream {0} is not writable")]
    StreamNotWritable(u32),

    /// The peer's SETTINGS_MAX_CONCURRENT_STREAMS does not allow another stream.
    #[error("Concurrent stream limit reached")]
    StreamLimitReached,

    /// Local configuration rejected before any I/O happened.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A protocol violation.
    #[error(transparent)]
    Protocol(#[from] H2Error),
}

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
