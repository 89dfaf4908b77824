//! DATA delivery and flow control

use bytes::Bytes;
use h2_conn::settings::settings_id;
use h2_conn::{flags, frame_type, ErrorCode, Settings, StreamEvent, StreamState};

use crate::peer::{request, response, server, server_with};

#[tokio::test]
async fn test_data_is_delivered_in_order() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/upload"), false).await;
    side.peer.send_data(1, b"hello ", false).await;
    side.peer.send_data(1, b"world", true).await;

    let mut stream = side.accept().await;
    assert!(matches!(stream.recv().await, Some(StreamEvent::Headers { end_stream: false, .. })));
    assert_eq!(
        stream.recv().await,
        Some(StreamEvent::Data {
            data: Bytes::from_static(b"hello "),
            end_stream: false,
        })
    );
    assert_eq!(
        stream.recv().await,
        Some(StreamEvent::Data {
            data: Bytes::from_static(b"world"),
            end_stream: true,
        })
    );
    assert_eq!(stream.state(), StreamState::HalfClosedRemote);
}

#[tokio::test]
async fn test_data_on_stream_zero_is_protocol_error() {
    let mut side = server().await;
    side.peer.send_data(0, b"oops", false).await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_stream_window_exceeded_resets_stream() {
    let settings = Settings {
        initial_window_size: 100,
        ..Settings::default()
    };
    let mut side = server_with(settings, &[]).await;
    side.peer.send_headers(1, &request("/"), false).await;
    side.peer.send_data(1, &[0u8; 200], false).await;

    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), frame_type::RST_STREAM);
    assert_eq!(frames[0].header.stream_id, 1);
    assert_eq!(frames[0].error_code(), ErrorCode::FlowControlError);

    let mut stream = side.accept().await;
    assert!(matches!(stream.recv().await, Some(StreamEvent::Headers { .. })));
    assert_eq!(stream.recv().await, Some(StreamEvent::Reset(ErrorCode::FlowControlError)));
    assert_eq!(side.conn.active_streams(), 0);
}

#[tokio::test]
async fn test_connection_window_update_is_batched() {
    let settings = Settings {
        initial_window_size: 1 << 20,
        ..Settings::default()
    };
    let mut side = server_with(settings, &[]).await;
    side.peer.send_headers(1, &request("/"), false).await;

    side.peer.send_data(1, &[1u8; 16384], false).await;
    assert!(side.peer.barrier().await.is_empty());

    side.peer.send_data(1, &[2u8; 16384], false).await;
    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), frame_type::WINDOW_UPDATE);
    assert_eq!(frames[0].header.stream_id, 0);
    assert_eq!(frames[0].u32_at(0), 32768);
}

#[tokio::test]
async fn test_stream_and_connection_windows_replenished() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;
    side.peer.send_data(1, &[0u8; 16384], false).await;
    side.peer.send_data(1, &[0u8; 16384], false).await;

    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind(), frame_type::WINDOW_UPDATE);
    assert_eq!(frames[0].header.stream_id, 1);
    assert_eq!(frames[0].u32_at(0), 32768);
    assert_eq!(frames[1].kind(), frame_type::WINDOW_UPDATE);
    assert_eq!(frames[1].header.stream_id, 0);
    assert_eq!(frames[1].u32_at(0), 32768);
}

#[tokio::test]
async fn test_end_stream_does_not_replenish_stream_window() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;
    side.peer.send_data(1, &[0u8; 16384], false).await;
    side.peer.send_data(1, &[0u8; 16384], true).await;

    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.stream_id, 0);
}

#[tokio::test]
async fn test_connection_window_exceeded_is_flow_control_error() {
    let settings = Settings {
        max_frame_size: 100_000,
        initial_window_size: 1 << 20,
        ..Settings::default()
    };
    let mut side = server_with(settings, &[]).await;
    side.peer.send_headers(1, &request("/"), false).await;
    side.peer.send_data(1, &vec![0u8; 70_000], false).await;

    let goaway = side.peer.expect_goaway(ErrorCode::FlowControlError).await;
    assert_eq!(goaway.u32_at(0), 1);
}

#[tokio::test]
async fn test_data_for_unknown_stream_still_counts() {
    let mut side = server().await;
    side.peer.send_data(1, &[0u8; 16384], false).await;
    side.peer.send_data(3, &[0u8; 16384], false).await;

    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1, "no RST_STREAM for unknown streams");
    assert_eq!(frames[0].kind(), frame_type::WINDOW_UPDATE);
    assert_eq!(frames[0].header.stream_id, 0);
    assert_eq!(frames[0].u32_at(0), 32768);
}

#[tokio::test]
async fn test_padding_is_stripped() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;

    let mut payload = vec![4];
    payload.extend_from_slice(b"hello");
    payload.extend_from_slice(&[0; 4]);
    side.peer
        .write_frame(frame_type::DATA, flags::PADDED | flags::END_STREAM, 1, &payload)
        .await;

    let mut stream = side.accept().await;
    stream.recv().await;
    assert_eq!(
        stream.recv().await,
        Some(StreamEvent::Data {
            data: Bytes::from_static(b"hello"),
            end_stream: true,
        })
    );
}

#[tokio::test]
async fn test_invalid_padding_is_protocol_error() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), false).await;
    side.peer
        .write_frame(frame_type::DATA, flags::PADDED, 1, &[9, 1, 2])
        .await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_data_after_end_stream_is_stream_closed() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), true).await;
    side.peer.send_data(1, b"late", false).await;

    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.stream_id, 1);
    assert_eq!(frames[0].error_code(), ErrorCode::StreamClosed);
}

#[tokio::test]
async fn test_write_data_waits_for_peer_window() {
    let mut side = server_with(Settings::default(), &[(settings_id::INITIAL_WINDOW_SIZE, 10)]).await;
    side.peer.send_headers(1, &request("/"), true).await;
    let stream = side.accept().await;
    stream.write_headers(response("200"), false).await.unwrap();
    side.peer.read_headers().await;

    let body = Bytes::from(vec![7u8; 25]);
    let write = tokio::spawn(async move {
        stream.write_data(body, true).await?;
        Ok::<_, h2_conn::Error>(stream)
    });

    let first = side.peer.read_until(frame_type::DATA).await;
    assert_eq!(first.payload.len(), 10);
    assert!(!first.header.is_end_stream());
    assert!(side.peer.barrier().await.is_empty(), "blocked on the stream window");

    side.peer.send_window_update(1, 15).await;
    let second = side.peer.read_until(frame_type::DATA).await;
    assert_eq!(second.payload.len(), 15);
    assert!(second.header.is_end_stream());

    let stream = write.await.unwrap().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(side.conn.active_streams(), 0);
}

#[tokio::test]
async fn test_data_is_split_at_peer_max_frame_size() {
    let mut side = server().await;
    side.peer.send_headers(1, &request("/"), true).await;
    let stream = side.accept().await;
    stream.write_headers(response("200"), false).await.unwrap();
    stream
        .write_data(Bytes::from(vec![1u8; 20_000]), true)
        .await
        .unwrap();

    side.peer.read_headers().await;
    let first = side.peer.read_frame().await;
    assert_eq!(first.kind(), frame_type::DATA);
    assert_eq!(first.payload.len(), 16384);
    let second = side.peer.read_frame().await;
    assert_eq!(second.payload.len(), 20_000 - 16384);
    assert!(second.header.is_end_stream());
}
