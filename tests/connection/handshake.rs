//! Preface and SETTINGS exchange

use h2_conn::settings::settings_id;
use h2_conn::{frame_type, flags, Connection, Error, ErrorCode, Role, Settings, CONNECTION_PREFACE};

use crate::peer::{server, server_unstarted, server_with, wait_done};

#[tokio::test]
async fn test_local_settings_announced_first() {
    let (local, remote) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(local);
    let settings = Settings {
        max_concurrent_streams: 7,
        enable_push: true,
        ..Settings::default()
    };
    let _conn = Connection::builder(Role::Server)
        .settings(settings)
        .stream_listener(|_| true)
        .spawn(read_half, write_half)
        .unwrap();

    let mut peer = crate::peer::Peer::new(remote);
    let frame = peer.read_frame().await;
    assert_eq!(frame.kind(), frame_type::SETTINGS);
    assert_eq!(frame.header.stream_id, 0);

    let params: Vec<(u16, u32)> = frame
        .payload
        .chunks(6)
        .map(|c| (u16::from_be_bytes([c[0], c[1]]), u32::from_be_bytes([c[2], c[3], c[4], c[5]])))
        .collect();
    assert!(params.contains(&(settings_id::MAX_CONCURRENT_STREAMS, 7)));
    // Push is forced off even when configured on
    assert!(params.contains(&(settings_id::ENABLE_PUSH, 0)));
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let (local, _remote) = tokio::io::duplex(64);
    let (read_half, write_half) = tokio::io::split(local);
    match Connection::builder(Role::Server).spawn(read_half, write_half) {
        Err(Error::InvalidConfig(_)) => {}
        other => panic!("Expected InvalidConfig for missing listener, got {:?}", other.map(|_| ())),
    }

    let (local, _remote) = tokio::io::duplex(64);
    let (read_half, write_half) = tokio::io::split(local);
    let result = Connection::builder(Role::Client)
        .settings(Settings {
            max_frame_size: 1024,
            ..Settings::default()
        })
        .spawn(read_half, write_half);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_settings_exchange_and_ack_accounting() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer.send_settings(&[]).await;

    let ack = side.peer.read_frame().await;
    assert_eq!(ack.kind(), frame_type::SETTINGS);
    assert!(ack.header.is_ack());
    assert_eq!(ack.payload.len(), 0);

    // Acknowledges the one SETTINGS frame sent at startup
    side.peer.send_settings_ack().await;
    side.peer.expect_silence().await;

    // Nothing left to acknowledge
    side.peer.send_settings_ack().await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    wait_done(&side.conn).await;
}

#[tokio::test]
async fn test_first_frame_must_be_settings() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer.write_frame(frame_type::PING, 0, 0, &[0; 8]).await;

    let goaway = side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    assert_eq!(goaway.u32_at(0), 0, "no stream was processed");
    wait_done(&side.conn).await;
    assert!(side.conn.is_done());
}

#[tokio::test]
async fn test_settings_ack_as_first_frame_is_rejected() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer.send_settings_ack().await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_invalid_preface_is_protocol_error() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    wait_done(&side.conn).await;
}

#[tokio::test]
async fn test_settings_length_must_be_multiple_of_six() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer
        .write_frame(frame_type::SETTINGS, 0, 0, &[0, 3, 0, 0, 0])
        .await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_settings_ack_with_payload_is_frame_size_error() {
    let mut side = server().await;
    side.peer
        .write_frame(frame_type::SETTINGS, flags::ACK, 0, &[0, 3, 0, 0, 0, 1])
        .await;
    side.peer.expect_goaway(ErrorCode::FrameSizeError).await;
}

#[tokio::test]
async fn test_settings_on_stream_is_protocol_error() {
    let mut side = server().await;
    side.peer.write_frame(frame_type::SETTINGS, 0, 1, &[]).await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_invalid_enable_push_value() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer.send_settings(&[(settings_id::ENABLE_PUSH, 2)]).await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_initial_window_above_maximum_is_flow_control_error() {
    let mut side = server_unstarted(Settings::default()).await;
    side.peer.write_raw(CONNECTION_PREFACE).await;
    side.peer
        .send_settings(&[(settings_id::INITIAL_WINDOW_SIZE, 0x8000_0000)])
        .await;
    side.peer.expect_goaway(ErrorCode::FlowControlError).await;
}

#[tokio::test]
async fn test_max_frame_size_out_of_range() {
    let mut side = server().await;
    side.peer.send_settings(&[(settings_id::MAX_FRAME_SIZE, 100)]).await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
}

#[tokio::test]
async fn test_rejected_settings_leave_remote_record_untouched() {
    let mut side = server_with(Settings::default(), &[(settings_id::MAX_CONCURRENT_STREAMS, 9)]).await;
    side.peer.expect_silence().await;
    assert_eq!(side.conn.remote_settings().max_concurrent_streams, 9);

    side.peer
        .send_settings(&[
            (settings_id::MAX_CONCURRENT_STREAMS, 3),
            (settings_id::MAX_FRAME_SIZE, 1),
        ])
        .await;
    side.peer.expect_goaway(ErrorCode::ProtocolError).await;
    assert_eq!(side.conn.remote_settings().max_concurrent_streams, 9);
}

#[tokio::test]
async fn test_later_settings_overwrite_remote_record() {
    let mut side = server_with(Settings::default(), &[(settings_id::MAX_FRAME_SIZE, 32768)]).await;
    side.peer
        .send_settings(&[(settings_id::HEADER_TABLE_SIZE, 1024), (0xf0, 1)])
        .await;
    let frames = side.peer.barrier().await;
    assert_eq!(frames.len(), 1);
    assert!(frames[0].header.is_ack());

    let remote = side.conn.remote_settings();
    assert_eq!(remote.header_table_size, 1024);
    assert_eq!(remote.max_frame_size, 32768);
}
