//! HTTP/2 connection: the frame dispatch loop and the public handle.
//!
//! Each connection runs exactly two tasks. The read loop spawned here
//! processes frames strictly in arrival order. The writer task (see
//! [`crate::writer`]) owns the write half. They share the stream registry and
//! the writer's send windows, both behind short-lived locks.
//!
//! Frame handlers return `Ok(Some(H2Error))` for protocol violations. The
//! error's stream id routes it: `0` ends the connection with GOAWAY,
//! anything else resets one stream. `Err(_)` is reserved for transport
//! failures, which close the writer without GOAWAY.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorCode, H2Error, Result};
use crate::flow_control::{ReceiveWindow, DEFAULT_CONNECTION_WINDOW_SIZE};
use crate::frame::{
    self, frame_type, FrameHeader, GoAway, Priority, CONNECTION_PREFACE, FRAME_HEADER_SIZE,
    GOAWAY_MIN_PAYLOAD_SIZE, PING_PAYLOAD_SIZE, PRIORITY_PAYLOAD_SIZE, RST_STREAM_PAYLOAD_SIZE,
    SETTING_ENTRY_SIZE, WINDOW_UPDATE_PAYLOAD_SIZE,
};
use crate::headers::HeaderAssembler;
use crate::hpack::{header_list_size, H2Header, HpackDecoder};
use crate::registry::StreamRegistry;
use crate::settings::{settings_id, Settings};
use crate::stream::{ResetOrigin, Stream, StreamHandle};
use crate::writer::{spawn_writer, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Largest stream id a client may allocate.
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Called for every new peer-initiated stream. Returning `false` refuses the
/// stream with RST_STREAM(REFUSED_STREAM). Runs on the read loop, so it must
/// not block.
pub type StreamListener = Box<dyn Fn(StreamHandle) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Settings we announce. `enable_push` is always forced off.
    pub settings: Settings,
    /// Bound on frames queued for the writer before callers wait.
    pub writer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            writer_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

pub struct ConnectionBuilder {
    role: Role,
    config: ConnectionConfig,
    listener: Option<StreamListener>,
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("role", &self.role)
            .field("config", &self.config)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl ConnectionBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn writer_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_capacity = capacity;
        self
    }

    pub fn stream_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(StreamHandle) -> bool + Send + Sync + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Validate the configuration and start the connection on the given
    /// transport halves. Must be called inside a Tokio runtime.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> Result<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut local = self.config.settings;
        local.enable_push = false;
        local.validate().map_err(Error::InvalidConfig)?;
        if self.role == Role::Server && self.listener.is_none() {
            return Err(Error::InvalidConfig("server connections need a stream listener"));
        }

        let (writer, writer_task) = spawn_writer(writer, self.role, self.config.writer_capacity);
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            role: self.role,
            registry: Arc::new(StreamRegistry::new()),
            writer,
            remote_settings: Mutex::new(Settings::remote_initial()),
            next_stream_id: tokio::sync::Mutex::new(1),
            local_settings: local.clone(),
            done,
        });

        let read_loop = ReadLoop {
            reader,
            shared: shared.clone(),
            listener: self.listener,
            buf: vec![0u8; local.max_frame_size as usize],
            remote: Settings::remote_initial(),
            settings_received: false,
            unacked_settings: 0,
            conn_window: ReceiveWindow::new(DEFAULT_CONNECTION_WINDOW_SIZE),
            last_incoming_stream_id: 0,
            headers: HeaderAssembler::new(),
            decoder: HpackDecoder::new(),
        };
        debug!(role = ?self.role, "starting connection");
        tokio::spawn(read_loop.run(writer_task));

        Ok(Connection { shared })
    }
}

#[derive(Debug)]
struct Shared {
    role: Role,
    registry: Arc<StreamRegistry>,
    writer: WriterHandle,
    local_settings: Settings,
    /// Mirror of the read loop's copy, for `open_stream` admission.
    remote_settings: Mutex<Settings>,
    /// Held across HEADERS emission so new streams hit the wire in id order.
    next_stream_id: tokio::sync::Mutex<u32>,
    done: watch::Sender<bool>,
}

/// Handle to a running connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder(role: Role) -> ConnectionBuilder {
        ConnectionBuilder {
            role,
            config: ConnectionConfig::default(),
            listener: None,
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn local_settings(&self) -> &Settings {
        &self.shared.local_settings
    }

    /// Last settings record received from the peer.
    pub fn remote_settings(&self) -> Settings {
        self.shared.remote_settings.lock().clone()
    }

    pub fn active_streams(&self) -> usize {
        self.shared.registry.len()
    }

    /// Open a new client stream by sending its request headers.
    pub async fn open_stream(&self, headers: Vec<H2Header>, end_stream: bool) -> Result<StreamHandle> {
        if self.shared.role != Role::Client {
            return Err(Error::InvalidConfig("only clients open streams"));
        }
        if self.shared.writer.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut next_stream_id = self.shared.next_stream_id.lock().await;
        let max_streams = self.shared.remote_settings.lock().max_concurrent_streams;
        if self.shared.registry.len() >= max_streams as usize || *next_stream_id > MAX_STREAM_ID {
            return Err(Error::StreamLimitReached);
        }
        let stream_id = *next_stream_id;
        *next_stream_id += 2;

        let handle = Stream::new(
            stream_id,
            true,
            self.shared.local_settings.initial_window_size,
            self.shared.writer.clone(),
            Arc::downgrade(&self.shared.registry),
        );
        self.shared.registry.insert(stream_id, handle.stream().clone());
        self.shared.writer.register_stream(stream_id);
        debug!(stream_id, "opening stream");

        if let Err(e) = handle.write_headers(headers, end_stream).await {
            // The HEADERS never made it out, so no RST_STREAM either.
            self.shared.registry.remove(stream_id);
            handle.stream().abort(ErrorCode::Cancel);
            return Err(e);
        }
        Ok(handle)
    }

    /// Close the connection immediately, without GOAWAY.
    pub fn close(&self) {
        self.shared.writer.close_now();
    }

    /// Resolves once both tasks have finished.
    pub async fn done(&self) {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }
}

type FrameResult = Result<Option<H2Error>>;

struct ReadLoop<R> {
    reader: R,
    shared: Arc<Shared>,
    listener: Option<StreamListener>,
    /// Payload buffer, reused for every frame.
    buf: Vec<u8>,
    remote: Settings,
    settings_received: bool,
    unacked_settings: u32,
    conn_window: ReceiveWindow,
    last_incoming_stream_id: u32,
    headers: HeaderAssembler,
    decoder: HpackDecoder,
}

impl<R: AsyncRead + Unpin> ReadLoop<R> {
    async fn run(mut self, writer_task: JoinHandle<Result<()>>) {
        let writer = self.shared.writer.clone();
        let result = tokio::select! {
            r = self.serve() => r,
            _ = writer.closed() => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "connection read loop failed");
            writer.close_now();
        }

        match writer_task.await {
            Ok(Err(e)) => debug!(error = %e, "writer finished with error"),
            Err(e) => warn!(error = %e, "writer task panicked"),
            Ok(Ok(())) => {}
        }

        for stream in self.shared.registry.drain() {
            stream.abort(ErrorCode::Cancel);
        }
        self.shared.done.send_replace(true);
        debug!("connection finished");
    }

    /// Returns `Ok(())` only after a GOAWAY has been queued.
    async fn serve(&mut self) -> Result<()> {
        let writer = self.shared.writer.clone();
        writer.write_settings(&self.shared.local_settings).await?;
        self.unacked_settings += 1;

        let mut pending = None;
        if self.shared.role == Role::Server {
            pending = self.read_preface().await?;
        }

        loop {
            let err = match pending.take() {
                Some(err) => err,
                None => match self.read_one_frame().await? {
                    Some(err) => err,
                    None => continue,
                },
            };

            if err.is_connection_error() {
                warn!(code = %err.code, message = %err.message, "connection error");
                let _ = writer.write_goaway(self.last_incoming_stream_id, err.code).await;
                return Ok(());
            }

            debug!(stream_id = err.stream_id, code = %err.code, message = %err.message, "stream error");
            match self.shared.registry.get(err.stream_id) {
                Some(stream) => stream.reset(err.code, ResetOrigin::Local).await,
                None => {
                    let _ = writer.write_reset_stream(err.stream_id, err.code).await;
                }
            }
        }
    }

    async fn read_preface(&mut self) -> Result<Option<H2Error>> {
        let mut preface = [0u8; 24];
        self.reader.read_exact(&mut preface).await?;
        if preface[..] != *CONNECTION_PREFACE {
            return Ok(Some(H2Error::protocol("Invalid connection preface")));
        }
        Ok(None)
    }

    async fn read_payload(&mut self, len: usize) -> Result<()> {
        self.reader.read_exact(&mut self.buf[..len]).await?;
        Ok(())
    }

    fn check_frame_size(&self, header: &FrameHeader) -> std::result::Result<(), H2Error> {
        if header.length > self.shared.local_settings.max_frame_size {
            return Err(H2Error::frame_size(format!(
                "{} frame of {} bytes exceeds the maximum frame size",
                frame::frame_type_name(header.frame_type),
                header.length
            )));
        }
        Ok(())
    }

    async fn read_one_frame(&mut self) -> FrameResult {
        let mut head = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut head).await?;
        let header = FrameHeader::decode(&head);
        trace!(
            kind = frame::frame_type_name(header.frame_type),
            stream_id = header.stream_id,
            len = header.length,
            flags = header.flags,
            "recv"
        );

        if let Some(expected) = self.headers.expected_stream() {
            if header.frame_type != frame_type::CONTINUATION || header.stream_id != expected {
                self.headers.clear();
                return Ok(Some(H2Error::protocol(format!(
                    "Expected CONTINUATION for stream {}, got {} on stream {}",
                    expected,
                    frame::frame_type_name(header.frame_type),
                    header.stream_id
                ))));
            }
        }

        if !self.settings_received && (header.frame_type != frame_type::SETTINGS || header.is_ack()) {
            return Ok(Some(H2Error::protocol("Expected SETTINGS frame as first frame")));
        }

        match header.frame_type {
            frame_type::SETTINGS => self.handle_settings(header).await,
            frame_type::PRIORITY => self.handle_priority(header).await,
            frame_type::PING => self.handle_ping(header).await,
            frame_type::WINDOW_UPDATE => self.handle_window_update(header).await,
            frame_type::PUSH_PROMISE => Ok(Some(H2Error::protocol(
                "Received PUSH_PROMISE but push is disabled",
            ))),
            frame_type::RST_STREAM => self.handle_rst_stream(header).await,
            frame_type::GOAWAY => self.handle_goaway(header).await,
            frame_type::DATA => self.handle_data(header).await,
            frame_type::HEADERS => self.handle_headers(header).await,
            frame_type::CONTINUATION => self.handle_continuation(header).await,
            _ => {
                // Extension frames are ignored.
                if let Err(e) = self.check_frame_size(&header) {
                    return Ok(Some(e));
                }
                self.read_payload(header.length as usize).await?;
                Ok(None)
            }
        }
    }

    async fn handle_settings(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id != 0 {
            return Ok(Some(H2Error::protocol("Received SETTINGS frame with invalid stream ID")));
        }

        if header.is_ack() {
            if header.length != 0 {
                return Ok(Some(H2Error::frame_size("Received SETTINGS ACK with non-zero length")));
            }
            if self.unacked_settings == 0 {
                return Ok(Some(H2Error::protocol("Received unexpected SETTINGS ACK")));
            }
            self.unacked_settings -= 1;
            return Ok(None);
        }

        if let Err(e) = self.check_frame_size(&header) {
            return Ok(Some(e));
        }
        let len = header.length as usize;
        if len % SETTING_ENTRY_SIZE != 0 {
            return Ok(Some(H2Error::protocol("Invalid SETTINGS frame length")));
        }
        self.read_payload(len).await?;

        let params = frame::decode_settings(&self.buf[..len]);
        if self.shared.role == Role::Client
            && params.contains(&(settings_id::ENABLE_PUSH, 1))
        {
            return Ok(Some(H2Error::protocol("Server sent ENABLE_PUSH=1")));
        }
        let updated = match self.remote.with_params(&params) {
            Ok(settings) => settings,
            Err(e) => return Ok(Some(e)),
        };
        if let Err(e) = self.shared.writer.update_settings(&updated).await {
            return Ok(Some(e));
        }

        *self.shared.remote_settings.lock() = updated.clone();
        self.remote = updated;
        self.settings_received = true;
        Ok(None)
    }

    async fn handle_priority(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id == 0 {
            return Ok(Some(H2Error::protocol("Received PRIORITY frame on stream 0")));
        }
        if header.length as usize != PRIORITY_PAYLOAD_SIZE {
            return Ok(Some(H2Error::frame_size("Received PRIORITY frame with invalid length")));
        }
        self.read_payload(PRIORITY_PAYLOAD_SIZE).await?;
        let priority = Priority::decode(&self.buf[..PRIORITY_PAYLOAD_SIZE]);
        trace!(
            stream_id = header.stream_id,
            dependency = priority.stream_dependency,
            weight = priority.weight,
            "ignoring PRIORITY"
        );
        Ok(None)
    }

    async fn handle_ping(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id != 0 {
            return Ok(Some(H2Error::protocol("Received PING frame on a non-zero stream")));
        }
        if header.length as usize != PING_PAYLOAD_SIZE {
            return Ok(Some(H2Error::frame_size("Received PING frame with invalid length")));
        }
        self.read_payload(PING_PAYLOAD_SIZE).await?;
        if header.is_ack() {
            // We never send PINGs of our own.
            return Ok(None);
        }

        let mut data = [0u8; PING_PAYLOAD_SIZE];
        data.copy_from_slice(&self.buf[..PING_PAYLOAD_SIZE]);
        let _ = self.shared.writer.write_ping_ack(data).await;
        Ok(None)
    }

    async fn handle_window_update(&mut self, header: FrameHeader) -> FrameResult {
        if header.length as usize != WINDOW_UPDATE_PAYLOAD_SIZE {
            return Ok(Some(H2Error::frame_size("Received WINDOW_UPDATE frame with invalid length")));
        }
        self.read_payload(WINDOW_UPDATE_PAYLOAD_SIZE).await?;
        let increment = frame::decode_window_update(&self.buf[..WINDOW_UPDATE_PAYLOAD_SIZE]);
        Ok(self
            .shared
            .writer
            .update_flow_control_window(header.stream_id, increment)
            .err())
    }

    async fn handle_rst_stream(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id == 0 {
            return Ok(Some(H2Error::protocol("Received RST_STREAM frame on stream 0")));
        }
        if header.length as usize != RST_STREAM_PAYLOAD_SIZE {
            return Ok(Some(H2Error::frame_size("Received RST_STREAM frame with invalid length")));
        }
        self.read_payload(RST_STREAM_PAYLOAD_SIZE).await?;
        let code = frame::decode_rst_stream(&self.buf[..RST_STREAM_PAYLOAD_SIZE]);

        if let Some(stream) = self.shared.registry.remove(header.stream_id) {
            stream.reset(code, ResetOrigin::Remote).await;
        }
        Ok(None)
    }

    async fn handle_goaway(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id != 0 || (header.length as usize) < GOAWAY_MIN_PAYLOAD_SIZE {
            return Ok(Some(H2Error::protocol("Received invalid GOAWAY frame header")));
        }
        if let Err(e) = self.check_frame_size(&header) {
            return Ok(Some(e));
        }
        let len = header.length as usize;
        self.read_payload(len).await?;
        let goaway = GoAway::decode(&self.buf[..len]);
        // Not acted upon: streams keep running until the peer closes.
        debug!(
            last_stream_id = goaway.last_stream_id,
            code = %goaway.error_code,
            debug_len = goaway.debug_data.len(),
            "received GOAWAY"
        );
        Ok(None)
    }

    async fn handle_data(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id == 0 {
            return Ok(Some(H2Error::protocol("Received DATA frame on stream 0")));
        }
        if let Err(e) = self.check_frame_size(&header) {
            return Ok(Some(e));
        }
        if self.conn_window.consume(header.length).is_err() {
            return Ok(Some(H2Error::connection(
                ErrorCode::FlowControlError,
                "Received more data than the connection window allows",
            )));
        }

        let len = header.length as usize;
        self.read_payload(len).await?;
        let data = match frame::data_payload(&header, &self.buf[..len]) {
            Ok(data) => Bytes::copy_from_slice(data),
            Err(e) => return Ok(Some(e)),
        };

        let result = match self.shared.registry.get(header.stream_id) {
            Some(stream) => stream
                .process_data(header.length, data, header.is_end_stream())
                .await
                .err(),
            None => {
                trace!(stream_id = header.stream_id, len, "discarding DATA for unknown stream");
                None
            }
        };

        if let Some(increment) = self.conn_window.reclaim() {
            let _ = self.shared.writer.write_window_update(0, increment).await;
        }
        Ok(result)
    }

    async fn handle_headers(&mut self, header: FrameHeader) -> FrameResult {
        if header.stream_id == 0 {
            return Ok(Some(H2Error::protocol("Received HEADERS frame on stream 0")));
        }
        if let Err(e) = self.check_frame_size(&header) {
            return Ok(Some(e));
        }
        let len = header.length as usize;
        self.read_payload(len).await?;
        let fragment = match frame::headers_payload(&header, &self.buf[..len]) {
            Ok(fragment) => fragment,
            Err(e) => return Ok(Some(e)),
        };

        if !header.is_end_headers() {
            return Ok(self
                .headers
                .start(header.stream_id, header.is_end_stream(), fragment)
                .err());
        }

        let decoded = match self.decoder.decode(fragment) {
            Ok(headers) => headers,
            Err(e) => return Ok(Some(e)),
        };
        Ok(self
            .on_header_block(header.stream_id, header.is_end_stream(), decoded)
            .await)
    }

    async fn handle_continuation(&mut self, header: FrameHeader) -> FrameResult {
        if let Err(e) = self.check_frame_size(&header) {
            return Ok(Some(e));
        }
        let len = header.length as usize;
        self.read_payload(len).await?;

        let block = match self
            .headers
            .append(header.stream_id, &self.buf[..len], header.is_end_headers())
        {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(None),
            Err(e) => return Ok(Some(e)),
        };
        let decoded = match self.decoder.decode(&block.fragment) {
            Ok(headers) => headers,
            Err(e) => return Ok(Some(e)),
        };
        Ok(self
            .on_header_block(block.stream_id, block.end_stream, decoded)
            .await)
    }

    /// A complete, decoded header block: route it to its stream or open a
    /// new one.
    async fn on_header_block(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        headers: Vec<H2Header>,
    ) -> Option<H2Error> {
        let local = &self.shared.local_settings;
        let list_size = header_list_size(&headers);
        let too_large = list_size > local.max_header_list_size as usize;

        if let Some(stream) = self.shared.registry.get(stream_id) {
            if too_large {
                return Some(header_list_too_large(stream_id, list_size));
            }
            return stream.process_headers(headers, end_stream).err();
        }

        let peer_initiated = match self.shared.role {
            Role::Server => stream_id % 2 == 1,
            Role::Client => stream_id % 2 == 0,
        };
        // Clients never accept HEADERS as stream-opening (no push).
        if self.shared.role != Role::Server || !peer_initiated || stream_id <= self.last_incoming_stream_id {
            return Some(H2Error::stream(
                stream_id,
                ErrorCode::RefusedStream,
                "Refusing HEADERS which don't open a new stream",
            ));
        }
        self.last_incoming_stream_id = stream_id;

        if too_large {
            return Some(header_list_too_large(stream_id, list_size));
        }
        if self.shared.registry.len() >= local.max_concurrent_streams as usize {
            return Some(H2Error::stream(
                stream_id,
                ErrorCode::RefusedStream,
                "Refusing stream due to max concurrent streams",
            ));
        }

        let handle = Stream::new(
            stream_id,
            false,
            local.initial_window_size,
            self.shared.writer.clone(),
            Arc::downgrade(&self.shared.registry),
        );
        let stream = handle.stream().clone();
        self.shared.registry.insert(stream_id, stream.clone());
        if !self.shared.writer.register_stream(stream_id) {
            return Some(H2Error::connection(
                ErrorCode::InternalError,
                "Can't register stream at writer",
            ));
        }

        if let Err(e) = stream.process_headers(headers, end_stream) {
            return Some(e);
        }

        stream.begin_offer();
        let accepted = match &self.listener {
            Some(listener) => listener(handle),
            None => {
                drop(handle);
                false
            }
        };
        let dropped = stream.end_offer();

        if !accepted {
            debug!(stream_id, "stream listener declined stream");
            stream.reset(ErrorCode::RefusedStream, ResetOrigin::Local).await;
        } else if dropped {
            debug!(stream_id, "stream listener dropped the accepted stream");
            stream.reset(ErrorCode::Cancel, ResetOrigin::Local).await;
        } else {
            debug!(stream_id, "accepted stream");
        }
        None
    }
}

fn header_list_too_large(stream_id: u32, size: usize) -> H2Error {
    H2Error::stream(
        stream_id,
        ErrorCode::ProtocolError,
        format!("Header list of {} bytes exceeds the advertised limit", size),
    )
}
