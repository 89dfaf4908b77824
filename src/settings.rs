//! HTTP/2 connection settings (RFC 9113 Section 6.5).

use crate::error::{ErrorCode, H2Error};

/// HTTP/2 SETTINGS identifiers (RFC 9113 Section 6.5.2)
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 256;

/// Default initial window size (64 KB - 1).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 65536;

/// Largest legal window size (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

pub const MIN_MAX_FRAME_SIZE: u32 = 16384;

pub const MAX_MAX_FRAME_SIZE: u32 = 0x00ff_ffff;

/// A full settings record for one side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the header compression table.
    pub header_table_size: u32,
    /// Whether server push is enabled. Always false for the local side.
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    /// Initial window size for stream-level flow control.
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Settings {
    /// The values every peer assumes before any SETTINGS frame arrives, with
    /// push disabled.
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: false,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
        }
    }
}

impl Settings {
    /// The remote record before the peer's first SETTINGS frame: protocol
    /// defaults, where concurrency is unlimited and push is allowed.
    pub fn remote_initial() -> Self {
        Self {
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            max_header_list_size: u32::MAX,
            ..Self::default()
        }
    }

    /// Check the documented ranges. Used for the locally configured record.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_window_size > MAX_WINDOW_SIZE {
            return Err("initial window size exceeds 2^31-1");
        }
        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err("max frame size outside 16384..=16777215");
        }
        if self.enable_push {
            return Err("server push is not supported");
        }
        Ok(())
    }

    /// Apply one received parameter. Unknown identifiers are ignored.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), H2Error> {
        match id {
            settings_id::HEADER_TABLE_SIZE => self.header_table_size = value,
            settings_id::ENABLE_PUSH => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1")),
            },
            settings_id::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            settings_id::INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(H2Error::connection(
                        ErrorCode::FlowControlError,
                        "initial window size exceeds maximum (2^31-1)",
                    ));
                }
                self.initial_window_size = value;
            }
            settings_id::MAX_FRAME_SIZE => {
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(H2Error::protocol("max frame size out of valid range"));
                }
                self.max_frame_size = value;
            }
            settings_id::MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
            _ => {}
        }
        Ok(())
    }

    /// Apply a whole SETTINGS frame to a copy of `self`.
    ///
    /// Either every parameter is valid and the returned record replaces the
    /// old one, or nothing changes.
    pub fn with_params(&self, params: &[(u16, u32)]) -> Result<Settings, H2Error> {
        let mut updated = self.clone();
        for &(id, value) in params {
            updated.apply(id, value)?;
        }
        Ok(updated)
    }

    /// Parameters to announce in our SETTINGS frame.
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        vec![
            (settings_id::HEADER_TABLE_SIZE, self.header_table_size),
            (settings_id::ENABLE_PUSH, self.enable_push as u32),
            (settings_id::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (settings_id::INITIAL_WINDOW_SIZE, self.initial_window_size),
            (settings_id::MAX_FRAME_SIZE, self.max_frame_size),
            (settings_id::MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
    }
}
