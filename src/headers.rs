//! Header block assembly across HEADERS + CONTINUATION frames.
//!
//! The accumulator is owned by the dispatch loop. While it holds a partial
//! block, the only frame allowed on the connection is a CONTINUATION for the
//! same stream.

use crate::error::H2Error;
use crate::frame::MAX_HEADER_BLOCK_SIZE;

/// A complete, still-encoded header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub stream_id: u32,
    /// END_STREAM from the HEADERS frame that started the block.
    pub end_stream: bool,
    pub fragment: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct HeaderAssembler {
    pending: Option<HeaderBlock>,
}

impl HeaderAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream whose CONTINUATION frames are expected next.
    pub fn expected_stream(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.stream_id)
    }

    /// Begin a block from a HEADERS frame without END_HEADERS.
    pub fn start(&mut self, stream_id: u32, end_stream: bool, fragment: &[u8]) -> Result<(), H2Error> {
        if fragment.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(H2Error::protocol(format!(
                "Header block too large ({} bytes, max {})",
                fragment.len(),
                MAX_HEADER_BLOCK_SIZE
            )));
        }
        self.pending = Some(HeaderBlock {
            stream_id,
            end_stream,
            fragment: fragment.to_vec(),
        });
        Ok(())
    }

    /// Add a CONTINUATION fragment. Returns the finished block once
    /// END_HEADERS is seen.
    pub fn append(
        &mut self,
        stream_id: u32,
        fragment: &[u8],
        end_headers: bool,
    ) -> Result<Option<HeaderBlock>, H2Error> {
        let pending = match self.pending.as_mut() {
            Some(p) => p,
            None => {
                return Err(H2Error::protocol(format!(
                    "Unexpected CONTINUATION frame for stream {}",
                    stream_id
                )))
            }
        };

        if pending.stream_id != stream_id {
            let expected = pending.stream_id;
            self.pending = None;
            return Err(H2Error::protocol(format!(
                "CONTINUATION for stream {} but pending headers on stream {}",
                stream_id, expected
            )));
        }

        let new_size = pending.fragment.len() + fragment.len();
        if new_size > MAX_HEADER_BLOCK_SIZE {
            self.pending = None;
            return Err(H2Error::protocol(format!(
                "Header block too large ({} bytes, max {})",
                new_size, MAX_HEADER_BLOCK_SIZE
            )));
        }
        pending.fragment.extend_from_slice(fragment);

        if end_headers {
            Ok(self.pending.take())
        } else {
            Ok(None)
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
