//! Per-stream state machine (RFC 9113 Section 5.1) and the public stream handle.
//!
//! ```text
//!            Idle
//!     send H /  \ recv H
//!           v    v
//!            Open ───────────────┐
//!   send ES /    \ recv ES       │ RST_STREAM (sent or received)
//!          v      v              v
//!  HalfClosedLocal  HalfClosedRemote   Reset
//!          \      /
//!   recv ES \    / send ES
//!            v  v
//!           Closed
//! ```
//!
//! A [`Stream`] is shared between the dispatch loop (which feeds it frames),
//! the registry, and the user's [`StreamHandle`]. It only holds a weak
//! reference to the registry, so it never keeps connection state alive.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, ErrorCode, H2Error, Result};
use crate::flow_control::ReceiveWindow;
use crate::hpack::H2Header;
use crate::registry::StreamRegistry;
use crate::writer::WriterHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

/// Something the peer sent on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Headers { headers: Vec<H2Header>, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Reset(ErrorCode),
}

/// Who triggered a reset. Only local resets put RST_STREAM on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOrigin {
    Local,
    Remote,
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    /// Final (non-informational) headers have arrived from the peer.
    headers_received: bool,
    recv_window: ReceiveWindow,
    reset_code: Option<ErrorCode>,
    /// Being offered to the stream listener; the dispatch loop settles a
    /// handle dropped during the offer.
    offering: bool,
    handle_dropped: bool,
}

#[derive(Debug)]
pub struct Stream {
    id: u32,
    locally_initiated: bool,
    inner: Mutex<StreamInner>,
    events: mpsc::UnboundedSender<StreamEvent>,
    writer: WriterHandle,
    registry: Weak<StreamRegistry>,
}

impl Stream {
    /// Create a stream in the `Idle` state together with the handle that
    /// receives its events.
    pub(crate) fn new(
        id: u32,
        locally_initiated: bool,
        recv_window: u32,
        writer: WriterHandle,
        registry: Weak<StreamRegistry>,
    ) -> StreamHandle {
        let (events, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Stream {
            id,
            locally_initiated,
            inner: Mutex::new(StreamInner {
                state: StreamState::Idle,
                headers_received: false,
                recv_window: ReceiveWindow::new(recv_window),
                reset_code: None,
                offering: false,
                handle_dropped: false,
            }),
            events,
            writer,
            registry,
        });
        StreamHandle { stream, events: rx }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub(crate) fn reset_code(&self) -> Option<ErrorCode> {
        self.inner.lock().reset_code
    }

    /// Handle a complete, decoded header block from the peer.
    pub(crate) fn process_headers(&self, headers: Vec<H2Header>, end_stream: bool) -> std::result::Result<(), H2Error> {
        let closed = {
            let mut inner = self.inner.lock();
            match inner.state {
                StreamState::Reset => return Ok(()),
                StreamState::HalfClosedRemote | StreamState::Closed => {
                    return Err(H2Error::stream(
                        self.id,
                        ErrorCode::StreamClosed,
                        "Received HEADERS on a stream closed by the peer",
                    ))
                }
                StreamState::Idle => {
                    inner.headers_received = true;
                    inner.state = if end_stream {
                        StreamState::HalfClosedRemote
                    } else {
                        StreamState::Open
                    };
                }
                StreamState::Open | StreamState::HalfClosedLocal => {
                    if !inner.headers_received {
                        // Response headers. 1xx blocks are delivered but the
                        // final response is still to come.
                        if end_stream || !(self.locally_initiated && is_informational(&headers)) {
                            inner.headers_received = true;
                        }
                    } else if !end_stream {
                        return Err(H2Error::stream(
                            self.id,
                            ErrorCode::RefusedStream,
                            "Received trailers without END_STREAM",
                        ));
                    }
                    if end_stream {
                        let next = match inner.state {
                            StreamState::Open => StreamState::HalfClosedRemote,
                            _ => StreamState::Closed,
                        };
                        inner.state = next;
                    }
                }
            }
            inner.state == StreamState::Closed
        };

        let _ = self.events.send(StreamEvent::Headers { headers, end_stream });
        if closed {
            self.finish();
        }
        Ok(())
    }

    /// Handle a DATA payload. `flow_len` is the full frame length (padding
    /// included), which is what flow control counts.
    pub(crate) async fn process_data(
        &self,
        flow_len: u32,
        data: Bytes,
        end_stream: bool,
    ) -> std::result::Result<(), H2Error> {
        let (increment, closed) = {
            let mut inner = self.inner.lock();
            match inner.state {
                StreamState::Reset => return Ok(()),
                StreamState::Open | StreamState::HalfClosedLocal if inner.headers_received => {}
                StreamState::Idle | StreamState::Open | StreamState::HalfClosedLocal => {
                    return Err(H2Error::stream(
                        self.id,
                        ErrorCode::StreamClosed,
                        "Received DATA before HEADERS",
                    ))
                }
                StreamState::HalfClosedRemote | StreamState::Closed => {
                    return Err(H2Error::stream(
                        self.id,
                        ErrorCode::StreamClosed,
                        "Received DATA on a stream closed by the peer",
                    ))
                }
            }

            if inner.recv_window.consume(flow_len).is_err() {
                return Err(H2Error::stream(
                    self.id,
                    ErrorCode::FlowControlError,
                    "Received more data than the stream window allows",
                ));
            }

            let increment = if end_stream {
                let next = match inner.state {
                    StreamState::Open => StreamState::HalfClosedRemote,
                    _ => StreamState::Closed,
                };
                inner.state = next;
                None
            } else {
                inner.recv_window.reclaim()
            };
            (increment, inner.state == StreamState::Closed)
        };

        let _ = self.events.send(StreamEvent::Data { data, end_stream });
        if let Some(increment) = increment {
            let _ = self.writer.write_window_update(self.id, increment).await;
        }
        if closed {
            self.finish();
        }
        Ok(())
    }

    /// Move the stream to `Reset`. Always drops the stream from the registry;
    /// the event and the RST_STREAM frame are only produced once.
    pub(crate) async fn reset(&self, code: ErrorCode, origin: ResetOrigin) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = StreamState::Reset;
            inner.reset_code = Some(code);
        }

        debug!(stream_id = self.id, %code, ?origin, "stream reset");
        let _ = self.events.send(StreamEvent::Reset(code));
        self.writer.unregister_stream(self.id);
        if origin == ResetOrigin::Local {
            let _ = self.writer.write_reset_stream(self.id, code).await;
        }
    }

    /// Connection teardown: mark the stream reset without emitting frames.
    pub(crate) fn abort(&self, code: ErrorCode) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = StreamState::Reset;
            inner.reset_code = Some(code);
        }
        let _ = self.events.send(StreamEvent::Reset(code));
        self.writer.unregister_stream(self.id);
    }

    pub(crate) fn begin_offer(&self) {
        self.inner.lock().offering = true;
    }

    /// Ends the listener offer. Returns true if the handle was dropped
    /// during it.
    pub(crate) fn end_offer(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.offering = false;
        inner.handle_dropped
    }

    /// The user's handle is gone: cancel the stream without suspending.
    fn release(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            inner.handle_dropped = true;
            if inner.offering || inner.state.is_terminal() {
                return;
            }
            let idle = inner.state == StreamState::Idle;
            inner.state = StreamState::Reset;
            inner.reset_code = Some(ErrorCode::Cancel);
            idle
        };

        debug!(stream_id = self.id, "stream handle dropped");
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.writer.unregister_stream(self.id);
        if !idle {
            self.writer.try_write_reset_stream(self.id, ErrorCode::Cancel);
        }
    }

    /// We are about to send HEADERS. Fails if the local side already ended
    /// the stream.
    pub(crate) fn on_headers_sent(&self, end_stream: bool) -> Result<()> {
        let closed = {
            let mut inner = self.inner.lock();
            let next = match (inner.state, end_stream) {
                (StreamState::Idle, false) => StreamState::Open,
                (StreamState::Idle, true) => StreamState::HalfClosedLocal,
                (state @ StreamState::Open, false) | (state @ StreamState::HalfClosedRemote, false) => state,
                (StreamState::Open, true) => StreamState::HalfClosedLocal,
                (StreamState::HalfClosedRemote, true) => StreamState::Closed,
                _ => return Err(self.not_writable(&inner)),
            };
            inner.state = next;
            next == StreamState::Closed
        };
        if closed {
            self.finish();
        }
        Ok(())
    }

    /// DATA may only follow our own HEADERS and precede our END_STREAM.
    pub(crate) fn check_data_writable(&self) -> Result<()> {
        let inner = self.inner.lock();
        match inner.state {
            StreamState::Open | StreamState::HalfClosedRemote => Ok(()),
            _ => Err(self.not_writable(&inner)),
        }
    }

    /// Our END_STREAM went out on a DATA frame.
    pub(crate) fn on_end_stream_sent(&self) {
        let closed = {
            let mut inner = self.inner.lock();
            let next = match inner.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => StreamState::Closed,
                other => other,
            };
            inner.state = next;
            next == StreamState::Closed
        };
        if closed {
            self.finish();
        }
    }

    fn not_writable(&self, inner: &StreamInner) -> Error {
        match inner.reset_code {
            Some(code) => Error::StreamReset {
                stream_id: self.id,
                code,
            },
            None => Error::StreamNotWritable(self.id),
        }
    }

    /// Map a writer failure to the reset that caused it, if any.
    fn write_error(&self, err: Error) -> Error {
        match (err, self.reset_code()) {
            (Error::StreamNotWritable(_), Some(code)) => Error::StreamReset {
                stream_id: self.id,
                code,
            },
            (err, _) => err,
        }
    }

    /// Both directions ended: retire the id.
    fn finish(&self) {
        debug!(stream_id = self.id, "stream closed");
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.writer.unregister_stream(self.id);
    }
}

fn is_informational(headers: &[H2Header]) -> bool {
    headers
        .iter()
        .find(|h| h.name == ":status")
        .map_or(false, |h| h.value.len() == 3 && h.value.starts_with('1'))
}

/// User-facing side of a stream. Dropping it before the stream is closed
/// resets the stream with CANCEL.
#[derive(Debug)]
pub struct StreamHandle {
    stream: Arc<Stream>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.stream.id
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Next event from the peer. `None` once the stream is finished and every
    /// event has been consumed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Send a header block (request, response or trailers).
    pub async fn write_headers(&self, headers: Vec<H2Header>, end_stream: bool) -> Result<()> {
        self.stream.on_headers_sent(end_stream)?;
        self.stream
            .writer
            .write_headers(self.stream.id, headers, end_stream)
            .await
            .map_err(|e| self.stream.write_error(e))
    }

    /// Send a body chunk. Resolves once the bytes are on the wire, which may
    /// take several WINDOW_UPDATEs from the peer.
    pub async fn write_data(&self, data: Bytes, end_stream: bool) -> Result<()> {
        self.stream.check_data_writable()?;
        self.stream
            .writer
            .write_data(self.stream.id, data, end_stream)
            .await
            .map_err(|e| self.stream.write_error(e))?;
        if end_stream {
            self.stream.on_end_stream_sent();
        }
        Ok(())
    }

    /// Abort the stream with RST_STREAM.
    pub async fn reset(&self, code: ErrorCode) {
        self.stream.reset(code, ResetOrigin::Local).await;
    }

    pub(crate) fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stream.release();
    }
}
