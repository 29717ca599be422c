//! Channel behaviour observed from a peer speaking raw frames

mod common;

use bytes::{Bytes, BytesMut};
use common::*;
use muxvc_connection::{Channel, ConnectState, IoEvent, MuxConfig, MuxListener, ShutdownHow, Vio};
use muxvc_proto::{Frame, MessageType, MAX_PAYLOAD};
use muxvc_transport::{MemoryNetwork, TransportConnector};
use std::time::Duration;

#[tokio::test]
async fn test_open_sends_open_frame() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;

    let a = mux.open_channel().await.unwrap();
    let b = mux.open_channel().await.unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    assert_eq!(mux.active_channels(), 2);

    assert_eq!(peer.next().await, Frame::control(MessageType::OpenChannel, 1));
    assert_eq!(peer.next().await, Frame::control(MessageType::OpenChannel, 2));
}

#[tokio::test]
async fn test_unknown_channel_data_is_reset() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;

    peer.send(Frame::data(7, Bytes::from_static(b"zz"))).await;
    assert_eq!(peer.next().await, Frame::control(MessageType::ChannelReset, 7));

    // Connection is still usable
    let channel = mux.open_channel().await.unwrap();
    assert_eq!(peer.next().await, Frame::control(MessageType::OpenChannel, channel.id()));
    assert_eq!(mux.state(), ConnectState::ConnectedActive);
}

#[tokio::test]
async fn test_remote_close_reports_eos_once() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let (handler, mut events) = collector();
    channel.read(1024, handler);

    peer.send(Frame::control(MessageType::CloseChannel, 1)).await;
    let (event, data) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::Eos);
    assert!(data.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    // No CLOSE echoed for a channel the peer closed
    channel.close();
    let next = mux.open_channel().await.unwrap();
    assert_eq!(next.id(), 2);
    assert_eq!(peer.next().await, Frame::control(MessageType::OpenChannel, 2));
}

#[tokio::test]
async fn test_local_close_sends_close() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    channel.close();
    channel.close();
    assert!(channel.is_closed());
    assert_eq!(peer.next().await, Frame::control(MessageType::CloseChannel, 1));
    assert_eq!(mux.state(), ConnectState::ConnectedIdle);
    peer.expect_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_banked_bytes_delivered_before_fresh_bytes() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    // Nobody is reading yet; these go to the bank
    peer.send(Frame::data(1, Bytes::from_static(b"abc"))).await;
    peer.send(Frame::data(1, Bytes::from_static(b"def"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (handler, mut events) = collector();
    channel.read(9, handler);
    assert_eq!(read_bytes(&mut events, 6).await, Bytes::from_static(b"abcdef"));

    peer.send(Frame::data(1, Bytes::from_static(b"ghi"))).await;
    let (event, data) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::ReadComplete);
    assert_eq!(data, Bytes::from_static(b"ghi"));
}

#[tokio::test]
async fn test_read_reissued_from_handler_keeps_order() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let (second, mut events) = collector();
    let mut second = Some(second);
    let (first_tx, mut first_rx) = tokio::sync::mpsc::unbounded_channel();
    channel.read(10, move |event: IoEvent, vio: &mut Vio, ch: &Channel| {
        let _ = first_tx.send((event, vio.buffer.split().freeze()));
        if let Some(next) = second.take() {
            ch.read(100, next);
        }
    });

    peer.send(Frame::data(1, Bytes::from_static(b"abc"))).await;
    let (event, data) = tokio::time::timeout(WAIT, first_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, IoEvent::ReadReady);
    assert_eq!(data, Bytes::from_static(b"abc"));

    peer.send(Frame::data(1, Bytes::from_static(b"def"))).await;
    peer.send(Frame::data(1, Bytes::from_static(b"ghi"))).await;
    assert_eq!(read_bytes(&mut events, 6).await, Bytes::from_static(b"defghi"));
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_header_drops_connection() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let (handler, mut events) = collector();
    channel.read(10, handler);

    // Version 9 is not spoken here
    peer.send_raw(&[9, 4, 0, 8, 0, 0, 0, 1]).await;

    let (event, _) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::Eos);
    assert_eq!(mux.state(), ConnectState::ConnectionDropped);
}

#[tokio::test]
async fn test_eos_waits_for_banked_bytes() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    peer.send(Frame::data(1, Bytes::from_static(b"tail"))).await;
    peer.send(Frame::control(MessageType::ShutdownWrite, 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (handler, mut events) = collector();
    channel.read(100, handler);

    let (event, data) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::ReadReady);
    assert_eq!(data, Bytes::from_static(b"tail"));
    let (event, _) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::Eos);
}

#[tokio::test]
async fn test_large_write_is_split_into_frames() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let payload = BytesMut::from(&vec![0x5au8; 70000][..]);
    let (handler, mut events) = collector();
    channel.write(70000, payload, handler);

    let first = peer.next().await;
    assert_eq!(first.msg_type, MessageType::NormalData);
    assert_eq!(first.payload.len(), MAX_PAYLOAD);
    assert_eq!(MAX_PAYLOAD, 65527);

    let second = peer.next().await;
    assert_eq!(second.msg_type, MessageType::NormalData);
    assert_eq!(second.payload.len(), 4473);

    let (event, _) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::WriteComplete);
}

#[tokio::test]
async fn test_write_ready_asks_for_more() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let mut sent_second = false;
    channel.write(
        6,
        BytesMut::from(&b"abc"[..]),
        move |event: IoEvent, vio: &mut muxvc_connection::Vio, _ch: &muxvc_connection::Channel| {
            if event == IoEvent::WriteReady && !sent_second {
                sent_second = true;
                vio.buffer.extend_from_slice(b"def");
            }
        },
    );

    assert_eq!(peer.next().await, Frame::data(1, Bytes::from_static(b"abc")));
    assert_eq!(peer.next().await, Frame::data(1, Bytes::from_static(b"def")));
}

#[tokio::test]
async fn test_shutdown_write_sends_frame() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    channel.shutdown(ShutdownHow::Write);
    assert_eq!(peer.next().await, Frame::control(MessageType::ShutdownWrite, 1));
    peer.expect_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_client_refuses_inbound_open() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;

    peer.send(Frame::control(MessageType::OpenChannel, 5)).await;
    assert_eq!(peer.next().await, Frame::control(MessageType::CloseChannel, 5));
    assert_eq!(mux.active_channels(), 0);
}

#[tokio::test]
async fn test_oob_data_is_discarded() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let (handler, mut events) = collector();
    channel.read(4, handler);

    peer.send(Frame::new(MessageType::OobData, 1, Bytes::from_static(b"urgent"))).await;
    peer.send(Frame::data(1, Bytes::from_static(b"data"))).await;

    let (event, data) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::ReadComplete);
    assert_eq!(data, Bytes::from_static(b"data"));
}

#[tokio::test]
async fn test_flow_control_start_and_stop() {
    let config = MuxConfig::default()
        .with_flow_control(true)
        .with_max_byte_bank(16);
    let (mux, mut peer) = connected_client(config).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    peer.send(Frame::data(1, Bytes::from(vec![1u8; 32]))).await;
    assert_eq!(peer.next().await, Frame::control(MessageType::FlowControlStart, 1));

    let (handler, mut events) = collector();
    channel.read(1024, handler);
    assert_eq!(read_bytes(&mut events, 32).await.len(), 32);
    assert_eq!(peer.next().await, Frame::control(MessageType::FlowControlStop, 1));
}

#[tokio::test]
async fn test_peer_flow_control_pauses_writes() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    peer.send(Frame::control(MessageType::FlowControlStart, 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    channel.write(5, BytesMut::from(&b"hello"[..]), ignore());
    peer.expect_quiet(Duration::from_millis(100)).await;

    peer.send(Frame::control(MessageType::FlowControlStop, 1)).await;
    assert_eq!(peer.next().await, Frame::data(1, Bytes::from_static(b"hello")));
}

#[tokio::test]
async fn test_peer_drop_notifies_channels() {
    let (mux, peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();

    let (reader, mut read_events) = collector();
    let (writer, mut write_events) = collector();
    channel.read(100, reader);
    channel.write(10, BytesMut::new(), writer);

    drop(peer);

    assert_eq!(next_event(&mut read_events).await.0, IoEvent::Eos);
    assert_eq!(next_event(&mut write_events).await.0, IoEvent::Error);
    assert_eq!(mux.state(), ConnectState::ConnectionDropped);

    channel.close();
    assert_eq!(mux.state(), ConnectState::Terminated);
    assert!(mux.open_channel().await.is_err());
}

#[tokio::test]
async fn test_active_timeout_reaches_reader() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let (handler, mut events) = collector();
    channel.read(10, handler);
    channel.set_active_timeout(Duration::from_millis(50));
    assert_eq!(channel.active_timeout(), Some(Duration::from_millis(50)));

    let (event, _) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::ActiveTimeout);
    assert_eq!(channel.active_timeout(), None);
}

#[tokio::test]
async fn test_cancelled_inactivity_timeout_does_not_fire() {
    let (mux, _peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();

    let (handler, mut events) = collector();
    channel.read(10, handler);
    channel.set_inactivity_timeout(Duration::from_millis(30));
    channel.cancel_inactivity_timeout();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(channel.inactivity_timeout(), None);
}

#[tokio::test]
async fn test_close_inside_handler() {
    let (mux, mut peer) = connected_client(MuxConfig::default()).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    channel.read(
        3,
        |event: IoEvent, _vio: &mut muxvc_connection::Vio, ch: &muxvc_connection::Channel| {
            if event == IoEvent::ReadComplete {
                ch.close();
            }
        },
    );
    peer.send(Frame::data(1, Bytes::from_static(b"bye"))).await;

    assert_eq!(peer.next().await, Frame::control(MessageType::CloseChannel, 1));
    assert!(channel.is_closed());
    assert_eq!(mux.active_channels(), 0);
}

#[tokio::test]
async fn test_server_resets_invalid_open() {
    let network = MemoryNetwork::new();
    let server_addr = addr("10.1.0.2:9444");
    let mut listener = MuxListener::new(network.bind(server_addr).unwrap(), MuxConfig::default()).unwrap();

    let stream = network.connector().connect(server_addr).await.unwrap();
    let mut peer = RawPeer::new(stream);

    peer.send(Frame::control(MessageType::OpenChannel, 1)).await;
    peer.send(Frame::control(MessageType::OpenChannel, 1)).await;
    peer.send(Frame::control(MessageType::OpenChannel, 0)).await;

    let accepted = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert_eq!(accepted.id(), 1);
    assert_eq!(peer.next().await, Frame::control(MessageType::ChannelReset, 1));
    assert_eq!(peer.next().await, Frame::control(MessageType::ChannelReset, 0));

    peer.send(Frame::data(1, Bytes::from_static(b"ping"))).await;
    let (handler, mut events) = collector();
    accepted.read(4, handler);
    assert_eq!(read_bytes(&mut events, 4).await, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn test_write_backlog_pauses_and_resumes() {
    let config = MuxConfig::default().with_write_high_water(MAX_PAYLOAD);
    let (mux, mut peer) = connected_client(config).await;
    let channel = mux.open_channel().await.unwrap();
    peer.next().await;

    let total = 200_000;
    let (handler, mut events) = collector();
    channel.write(total, BytesMut::from(&vec![7u8; total][..]), handler);

    let mut received = 0;
    while received < total {
        let frame = peer.next().await;
        assert_eq!(frame.msg_type, MessageType::NormalData);
        assert!(frame.payload.len() <= MAX_PAYLOAD);
        received += frame.payload.len();
    }
    assert_eq!(received, total);

    let (event, _) = next_event(&mut events).await;
    assert_eq!(event, IoEvent::WriteComplete);
}
