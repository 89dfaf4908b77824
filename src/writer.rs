//! Dedicated writer task: the only code that writes to the transport.
//!
//! # Architecture
//!
//! ```text
//! Dispatch loop ─┐                      ┌─ control frames (FIFO)
//! StreamHandle 1 ┼─► mpsc::Sender ─► Writer Task ─┤
//! StreamHandle N ┘                      └─ DATA queue (round-robin, flow controlled)
//! ```
//!
//! Control frames go out in the order they were enqueued. DATA requests wait
//! in a per-request queue until both the connection and the stream send
//! windows have credit; WINDOW_UPDATEs from the peer wake the scheduler.
//! The send windows live in [`WriterShared`] so the dispatch loop can update
//! them without a round trip through the task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::Role;
use crate::error::{Error, ErrorCode, H2Error, Result};
use crate::flow_control::{Window, DEFAULT_CONNECTION_WINDOW_SIZE};
use crate::frame::{self, CONNECTION_PREFACE};
use crate::hpack::{header_list_size, H2Header, HpackEncoder};
use crate::settings::Settings;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A DATA write waiting for flow-control credit.
#[derive(Debug)]
struct PendingData {
    stream_id: u32,
    data: Bytes,
    end_stream: bool,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Debug)]
enum Command {
    /// A pre-encoded control frame.
    Frame(Bytes),
    /// New remote settings: re-derive limits, then acknowledge.
    Settings {
        max_frame_size: u32,
        max_header_list_size: u32,
    },
    Headers {
        stream_id: u32,
        headers: Vec<H2Header>,
        end_stream: bool,
        done: oneshot::Sender<Result<()>>,
    },
    Data(PendingData),
    /// Write the frame, flush, and shut the transport down.
    GoAway(Bytes),
}

enum Reservation {
    Granted(usize),
    Blocked,
    Gone,
}

/// Send-side flow-control windows, owned jointly by the writer task and the
/// dispatch loop.
#[derive(Debug)]
struct WindowTable {
    connection: Window,
    streams: HashMap<u32, Window>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE; new streams start here.
    remote_initial: u32,
}

impl WindowTable {
    fn reserve(&mut self, stream_id: u32, wanted: usize, max_frame_size: usize) -> Reservation {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(w) => w,
            None => return Reservation::Gone,
        };
        if wanted == 0 {
            return Reservation::Granted(0);
        }
        let available = self.connection.available().min(stream.available());
        if available <= 0 {
            return Reservation::Blocked;
        }
        let n = wanted.min(max_frame_size).min(available as usize);
        // Cannot fail: n is bounded by both windows.
        let _ = stream.debit(n as u32);
        let _ = self.connection.debit(n as u32);
        Reservation::Granted(n)
    }
}

#[derive(Debug)]
struct WriterShared {
    windows: Mutex<WindowTable>,
    shutdown: Notify,
    window_credit: Notify,
    closed: watch::Sender<bool>,
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across streams.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Command>,
    shared: Arc<WriterShared>,
}

impl WriterHandle {
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Abort without GOAWAY. Pending and future writes fail with
    /// [`Error::ConnectionClosed`].
    pub fn close_now(&self) {
        if !self.shared.closed.send_replace(true) {
            debug!("closing writer");
        }
        self.shared.shutdown.notify_one();
    }

    /// Resolves once the writer is closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.tx.send(command).await.map_err(|_| Error::ConnectionClosed)
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.send(Command::Frame(Bytes::from(frame))).await
    }

    /// Our SETTINGS frame.
    pub async fn write_settings(&self, settings: &Settings) -> Result<()> {
        self.send_frame(frame::settings(&settings.to_params())).await
    }

    /// Take over a new remote settings record.
    ///
    /// A changed initial window size shifts every stream's send window by the
    /// difference. The SETTINGS ack is queued behind any frame already
    /// enqueued.
    pub async fn update_settings(&self, remote: &Settings) -> std::result::Result<(), H2Error> {
        let opened = {
            let mut windows = self.shared.windows.lock();
            let delta = remote.initial_window_size as i64 - windows.remote_initial as i64;
            if delta != 0 {
                let mut adjusted: Vec<(u32, Window)> = Vec::with_capacity(windows.streams.len());
                for (&id, window) in windows.streams.iter() {
                    let mut window = *window;
                    if window.adjust(delta).is_err() {
                        return Err(H2Error::connection(
                            ErrorCode::FlowControlError,
                            format!("initial window change overflows the window of stream {}", id),
                        ));
                    }
                    adjusted.push((id, window));
                }
                windows.streams.extend(adjusted);
            }
            windows.remote_initial = remote.initial_window_size;
            delta > 0
        };
        if opened {
            self.shared.window_credit.notify_one();
        }

        let _ = self
            .send(Command::Settings {
                max_frame_size: remote.max_frame_size,
                max_header_list_size: remote.max_header_list_size,
            })
            .await;
        Ok(())
    }

    /// Create the send window for a stream. Returns false if it already exists.
    pub fn register_stream(&self, stream_id: u32) -> bool {
        let mut windows = self.shared.windows.lock();
        if windows.streams.contains_key(&stream_id) {
            return false;
        }
        let initial = windows.remote_initial;
        windows.streams.insert(stream_id, Window::new(initial));
        true
    }

    /// Drop a stream's send window; queued DATA for it fails.
    pub fn unregister_stream(&self, stream_id: u32) {
        let removed = self.shared.windows.lock().streams.remove(&stream_id).is_some();
        if removed {
            self.shared.window_credit.notify_one();
        }
    }

    /// Apply a WINDOW_UPDATE received from the peer.
    pub fn update_flow_control_window(&self, stream_id: u32, increment: u32) -> std::result::Result<(), H2Error> {
        if increment == 0 {
            return Ok(());
        }
        {
            let mut windows = self.shared.windows.lock();
            if stream_id == 0 {
                windows.connection.credit(increment).map_err(|_| {
                    H2Error::connection(ErrorCode::FlowControlError, "connection send window overflow")
                })?;
            } else if let Some(window) = windows.streams.get_mut(&stream_id) {
                window.credit(increment).map_err(|_| {
                    H2Error::stream(stream_id, ErrorCode::FlowControlError, "stream send window overflow")
                })?;
            } else {
                return Ok(());
            }
        }
        self.shared.window_credit.notify_one();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn stream_send_window(&self, stream_id: u32) -> Option<i64> {
        self.shared.windows.lock().streams.get(&stream_id).map(Window::available)
    }

    #[cfg(test)]
    pub(crate) fn connection_send_window(&self) -> i64 {
        self.shared.windows.lock().connection.available()
    }

    pub async fn write_window_update(&self, stream_id: u32, increment: u32) -> Result<()> {
        self.send_frame(frame::window_update(stream_id, increment)).await
    }

    pub async fn write_ping_ack(&self, data: [u8; frame::PING_PAYLOAD_SIZE]) -> Result<()> {
        self.send_frame(frame::ping_ack(data)).await
    }

    pub async fn write_reset_stream(&self, stream_id: u32, code: ErrorCode) -> Result<()> {
        self.send_frame(frame::rst_stream(stream_id, code)).await
    }

    /// Queue RST_STREAM without waiting. Used where the caller cannot
    /// suspend; falls back to a spawned send when the channel is full.
    pub fn try_write_reset_stream(&self, stream_id: u32, code: ErrorCode) {
        if self.is_closed() {
            return;
        }
        let command = Command::Frame(Bytes::from(frame::rst_stream(stream_id, code)));
        match self.tx.try_send(command) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let tx = self.tx.clone();
                    runtime.spawn(async move {
                        let _ = tx.send(command).await;
                    });
                }
            }
        }
    }

    /// Queue GOAWAY and close the writer once it has been flushed.
    pub async fn write_goaway(&self, last_stream_id: u32, code: ErrorCode) -> Result<()> {
        let result = self
            .send(Command::GoAway(Bytes::from(frame::goaway(last_stream_id, code))))
            .await;
        self.shared.closed.send_replace(true);
        result
    }

    /// Encode and send a header block. Resolves once it is on the wire.
    pub async fn write_headers(&self, stream_id: u32, headers: Vec<H2Header>, end_stream: bool) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Headers {
            stream_id,
            headers,
            end_stream,
            done,
        })
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send a body chunk under flow control. Resolves once every byte is on
    /// the wire.
    pub async fn write_data(&self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Data(PendingData {
            stream_id,
            data,
            end_stream,
            done,
        }))
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    #[cfg(test)]
    pub(crate) fn closed_for_tests() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(true);
        WriterHandle {
            tx,
            shared: Arc::new(WriterShared {
                windows: Mutex::new(WindowTable {
                    connection: Window::new(DEFAULT_CONNECTION_WINDOW_SIZE),
                    streams: HashMap::new(),
                    remote_initial: Settings::remote_initial().initial_window_size,
                }),
                shutdown: Notify::new(),
                window_credit: Notify::new(),
                closed,
            }),
        }
    }
}

/// Spawn the writer task on `transport`.
///
/// The task ends when every handle is dropped, after GOAWAY, on
/// [`WriterHandle::close_now`], or on the first I/O error.
pub fn spawn_writer<W>(transport: W, role: Role, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed, _) = watch::channel(false);
    let remote = Settings::remote_initial();
    let shared = Arc::new(WriterShared {
        windows: Mutex::new(WindowTable {
            connection: Window::new(DEFAULT_CONNECTION_WINDOW_SIZE),
            streams: HashMap::new(),
            remote_initial: remote.initial_window_size,
        }),
        shutdown: Notify::new(),
        window_credit: Notify::new(),
        closed,
    });

    let task = WriterTask {
        transport,
        rx,
        shared: shared.clone(),
        encoder: HpackEncoder::new(),
        pending: VecDeque::new(),
        max_frame_size: remote.max_frame_size,
        max_header_list_size: remote.max_header_list_size,
    };
    let join = tokio::spawn(task.run(role));

    (WriterHandle { tx, shared }, join)
}

struct WriterTask<W> {
    transport: W,
    rx: mpsc::Receiver<Command>,
    shared: Arc<WriterShared>,
    encoder: HpackEncoder,
    pending: VecDeque<PendingData>,
    max_frame_size: u32,
    max_header_list_size: u32,
}

impl<W: AsyncWrite + Unpin> WriterTask<W> {
    async fn run(mut self, role: Role) -> Result<()> {
        let shared = self.shared.clone();
        let result = tokio::select! {
            r = self.serve(role) => r,
            _ = shared.shutdown.notified() => Ok(()),
        };

        shared.closed.send_replace(true);
        self.rx.close();
        for pending in self.pending.drain(..) {
            let _ = pending.done.send(Err(Error::ConnectionClosed));
        }
        let _ = self.transport.shutdown().await;
        if let Err(ref e) = result {
            debug!(error = %e, "writer stopped");
        }
        result
    }

    async fn serve(&mut self, role: Role) -> Result<()> {
        if role == Role::Client {
            self.transport.write_all(CONNECTION_PREFACE).await?;
        }

        loop {
            let progressed = self.flush_data().await?;

            let command = if self.pending.is_empty() {
                self.rx.recv().await
            } else if progressed {
                match self.rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => None,
                }
            } else {
                let shared = self.shared.clone();
                tokio::select! {
                    biased;
                    command = self.rx.recv() => command,
                    _ = shared.window_credit.notified() => continue,
                }
            };

            match command {
                None => return Ok(()),
                Some(Command::Frame(bytes)) => {
                    trace_frame(&bytes);
                    self.transport.write_all(&bytes).await?;
                    self.transport.flush().await?;
                }
                Some(Command::Settings {
                    max_frame_size,
                    max_header_list_size,
                }) => {
                    self.max_frame_size = max_frame_size;
                    self.max_header_list_size = max_header_list_size;
                    let ack = frame::settings_ack();
                    trace_frame(&ack);
                    self.transport.write_all(&ack).await?;
                    self.transport.flush().await?;
                }
                Some(Command::Headers {
                    stream_id,
                    headers,
                    end_stream,
                    done,
                }) => {
                    let result = self.write_header_block(stream_id, &headers, end_stream).await?;
                    let _ = done.send(result);
                }
                Some(Command::Data(pending)) => self.pending.push_back(pending),
                Some(Command::GoAway(bytes)) => {
                    trace_frame(&bytes);
                    self.transport.write_all(&bytes).await?;
                    self.transport.flush().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Outer error: the transport failed. Inner error: only this block was
    /// rejected.
    async fn write_header_block(
        &mut self,
        stream_id: u32,
        headers: &[H2Header],
        end_stream: bool,
    ) -> Result<Result<()>> {
        let size = header_list_size(headers);
        if size > self.max_header_list_size as usize {
            return Ok(Err(Error::Protocol(H2Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                format!(
                    "header list of {} bytes exceeds the peer's limit of {}",
                    size, self.max_header_list_size
                ),
            ))));
        }

        let block = self.encoder.encode(headers);
        let frames = frame::header_block_frames(stream_id, &block, end_stream, self.max_frame_size as usize);
        trace!(stream_id, len = block.len(), end_stream, "send HEADERS");
        self.transport.write_all(&frames).await?;
        self.transport.flush().await?;
        Ok(Ok(()))
    }

    /// Give every queued request at most one DATA frame, as far as flow
    /// control allows. Returns true if anything was written, so the caller
    /// can check for control frames before the next round.
    async fn flush_data(&mut self) -> Result<bool> {
        let mut wrote = false;

        for _ in 0..self.pending.len() {
            let mut pending = match self.pending.pop_front() {
                Some(p) => p,
                None => break,
            };

            let reservation = self.shared.windows.lock().reserve(
                pending.stream_id,
                pending.data.len(),
                self.max_frame_size as usize,
            );

            match reservation {
                Reservation::Gone => {
                    let _ = pending.done.send(Err(Error::StreamNotWritable(pending.stream_id)));
                }
                Reservation::Blocked => self.pending.push_back(pending),
                Reservation::Granted(n) => {
                    let chunk = pending.data.split_to(n);
                    let last = pending.data.is_empty();
                    let end_stream = last && pending.end_stream;
                    trace!(stream_id = pending.stream_id, len = n, end_stream, "send DATA");
                    self.transport
                        .write_all(&frame::data_header(pending.stream_id, n, end_stream))
                        .await?;
                    self.transport.write_all(&chunk).await?;
                    wrote = true;

                    if last {
                        self.transport.flush().await?;
                        let _ = pending.done.send(Ok(()));
                    } else {
                        self.pending.push_back(pending);
                    }
                }
            }
        }

        if wrote {
            self.transport.flush().await?;
        }
        Ok(wrote)
    }
}

fn trace_frame(bytes: &[u8]) {
    if let Some(header) = frame::FrameHeader::parse(bytes) {
        trace!(
            kind = frame::frame_type_name(header.frame_type),
            stream_id = header.stream_id,
            len = header.length,
            flags = header.flags,
            "send"
        );
    }
}
