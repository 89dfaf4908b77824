//! h2-conn: An async HTTP/2 connection engine
//!
//! This crate runs the connection-level half of HTTP/2 on top of any Tokio
//! byte stream: the frame dispatch loop, per-stream state machines, flow
//! control, and a dedicated writer task. Request/response semantics are left
//! to the caller.
//!
//! # Features
//!
//! - **Two tasks per connection**: a sequential read loop and a single writer
//! - **Flow Control**: batched WINDOW_UPDATE emission, per-stream send windows
//! - **CONTINUATION Assembly**: header blocks reassembled before decoding
//! - **HPACK Support**: Header compression via fluke-hpack
//! - **Error classification**: connection errors end with GOAWAY, stream
//!   errors reset only the offending stream
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use h2_conn::{Connection, H2Header, Role, StreamEvent};
//!
//! # async fn run(socket: tokio::io::DuplexStream) -> h2_conn::Result<()> {
//! let (read_half, write_half) = tokio::io::split(socket);
//!
//! let conn = Connection::builder(Role::Server)
//!     .stream_listener(|mut stream| {
//!         tokio::spawn(async move {
//!             while let Some(event) = stream.recv().await {
//!                 if let StreamEvent::Headers { end_stream: true, .. } = event {
//!                     let response = vec![H2Header::new(":status", "204")];
//!                     let _ = stream.write_headers(response, true).await;
//!                 }
//!             }
//!         });
//!         true
//!     })
//!     .spawn(read_half, write_half)?;
//!
//! conn.done().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! transport ─► read loop ─► frame handlers ─► stream registry ─► Stream ─► StreamHandle
//!                   │                                               │
//!                   └──────── GOAWAY / RST / WINDOW_UPDATE ────► writer task ─► transport
//! ```
//!
//! It does NOT provide:
//! - Server push (always disabled)
//! - Stream prioritization (PRIORITY is parsed and ignored)
//! - TLS (wrap the transport yourself)

pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod headers;
pub mod hpack;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod writer;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, Role, StreamListener};
pub use error::{Error, ErrorCode, H2Error, Result};
pub use frame::{flags, frame_type, FrameHeader, CONNECTION_PREFACE, MAX_HEADER_BLOCK_SIZE};
pub use hpack::{H2Header, HpackDecoder, HpackEncoder};
pub use settings::{settings_id, Settings};
pub use stream::{ResetOrigin, StreamEvent, StreamHandle, StreamState};
