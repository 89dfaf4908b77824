//! Connection shutdown and client-initiated streams

use bytes::Bytes;
use h2_conn::settings::settings_id;
use h2_conn::{frame_type, Error, ErrorCode, H2Header, StreamEvent, StreamState};

use crate::peer::{client_with, request, response, server, wait_done};

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_peer_disconnect_cancels_streams() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;
    let mut stream = side.accept().await;
    assert!(matches!(stream.recv().await, Some(StreamEvent::Headers { .. })));

    drop(side.peer);
    wait_done(&side.conn).await;

    assert_eq!(stream.recv().await, Some(StreamEvent::Reset(ErrorCode::Cancel)));
    assert_eq!(stream.state(), StreamState::Reset);
    assert_eq!(side.conn.active_streams(), 0);
}

#[tokio::test]
async fn test_close_ends_connection_without_goaway() {
    let mut side = server().await;
    side.conn.close();
    side.peer.expect_eof().await;
    wait_done(&side.conn).await;
    assert!(side.conn.is_done());
}

#[tokio::test]
async fn test_goaway_reports_highest_incoming_stream() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), true).await;
    side.peer.send_headers(5, &request("/"), true).await;
    let _first = side.accept().await;
    let _second = side.accept().await;

    side.peer.write_frame(frame_type::PING, 0, 3, &[0; 8]).await;
    let goaway = side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    assert_eq!(goaway.u32_at(0), 5);
    wait_done(&side.conn).await;
}

#[tokio::test]
async fn test_goaway_skips_refused_stream_ids() {
    let mut side = server().await;
    side.peer.send_headers(2, &request("/"), true).await;
    side.peer.send_headers(3, &request("/"), true).await;
    side.peer.send_rst_stream(0, ErrorCode::Cancel).await;

    let goaway = side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    assert_eq!(goaway.u32_at(0), 3);
}

#[tokio::test]
async fn test_writes_fail_after_close() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), true).await;
    let mut stream = side.accept().await;

    side.conn.close();
    wait_done(&side.conn).await;

    assert!(stream.write_headers(response("200"), true).await.is_err());
    assert!(stream.write_data(Bytes::from_static(b"x"), true).await.is_err());
    assert!(matches!(stream.recv().await, Some(StreamEvent::Headers { .. })));
    assert_eq!(stream.recv().await, Some(StreamEvent::Reset(ErrorCode::Cancel)));
}

#[tokio::test]
async fn test_local_reset_sends_rst_stream() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;
    let stream = side.accept().await;

    stream.reset(ErrorCode::Cancel).await;
    let rst = side.peer.read_until(frame_type::RST_STREAM).await;
    assert_eq!(rst.header.stream_id, 1);
    assert_eq!(rst.error_code(), ErrorCode::Cancel);
    assert_eq!(side.conn.active_streams(), 0);

    // Resetting twice emits nothing more
    stream.reset(ErrorCode::InternalError).await;
    side.peer.expect_silence().await;
}

// ============================================================================
// Client streams
// ============================================================================

#[tokio::test]
async fn test_client_opens_odd_streams_in_order() {
    let (conn, mut peer) = client_with(&[]).await;

    let mut first = conn.open_stream(request("/one"), true).await.unwrap();
    let second = conn.open_stream(request("/two"), true).await.unwrap();
    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 3);
    assert_eq!(first.state(), StreamState::HalfClosedLocal);

    let (header, headers) = peer.read_headers().await;
    assert_eq!(header.stream_id, 1);
    assert!(header.is_end_stream());
    assert_eq!(headers, request("/one"));
    let (header, _) = peer.read_headers().await;
    assert_eq!(header.stream_id, 3);

    peer.send_headers(1, &response("100"), false).await;
    peer.send_headers(1, &response("200"), false).await;
    peer.send_data(1, b"payload", true).await;
    peer.expect_silence().await;

    match first.recv().await {
        Some(StreamEvent::Headers { headers, end_stream }) => {
            assert_eq!(headers, response("100"));
            assert!(!end_stream);
        }
        other => panic!("Expected informational headers, got {:?}", other),
    }
    assert!(matches!(first.recv().await, Some(StreamEvent::Headers { .. })));
    assert_eq!(
        first.recv().await,
        Some(StreamEvent::Data {
            data: Bytes::from_static(b"payload"),
            end_stream: true,
        })
    );
    assert_eq!(first.state(), StreamState::Closed);
    assert_eq!(conn.active_streams(), 1);
}

#[tokio::test]
async fn test_client_streams_carry_request_body() {
    let (conn, mut peer) = client_with(&[]).await;
    let stream = conn.open_stream(request("/upload"), false).await.unwrap();
    stream.write_data(Bytes::from_static(b"body"), true).await.unwrap();
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);

    peer.read_headers().await;
    let data = peer.read_frame().await;
    assert_eq!(data.kind(), frame_type::DATA);
    assert_eq!(data.payload, b"body");
    assert!(data.header.is_end_stream());

    // Nothing more may be written once END_STREAM went out
    assert!(matches!(
        stream.write_data(Bytes::from_static(b"more"), false).await,
        Err(Error::StreamNotWritable(1))
    ));
}

#[tokio::test]
async fn test_client_refuses_server_initiated_stream() {
    let (_conn, mut peer) = client_with(&[]).await;
    peer.send_headers(2, &[H2Header::new(":status", "200")], true).await;

    let frames = peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.stream_id, 2);
    assert_eq!(frames[0].error_code(), ErrorCode::RefusedStream);
}

#[tokio::test]
async fn test_client_respects_peer_stream_limit() {
    let (conn, _peer) = client_with(&[(settings_id::MAX_CONCURRENT_STREAMS, 1)]).await;
    let _first = conn.open_stream(request("/"), false).await.unwrap();
    assert!(matches!(
        conn.open_stream(request("/"), false).await,
        Err(Error::StreamLimitReached)
    ));
}

#[tokio::test]
async fn test_server_cannot_open_streams() {
    let side = server().await;
    assert!(matches!(
        side.conn.open_stream(request("/"), true).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_client_rejects_enable_push() {
    let (conn, mut peer) = client_with(&[]).await;
    peer.send_settings(&[(settings_id::ENABLE_PUSH, 1)]).await;
    peer.expect_goaway(ErrorCode::ProtocolError).await;
    wait_done(&conn).await;

    assert!(matches!(
        conn.open_stream(request("/"), true).await,
        Err(Error::ConnectionClosed)
    ));
}
