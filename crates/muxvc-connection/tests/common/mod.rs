//! Shared helpers for multiplexer integration tests
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use muxvc_connection::{Channel, IoEvent, IoHandler, MuxConfig, Multiplexer, Vio};
use muxvc_proto::{Frame, FrameCodec};
use muxvc_transport::{BoxedStream, MemoryNetwork, TransportListener};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Peer that speaks raw frames
pub struct RawPeer {
    framed: Framed<BoxedStream, FrameCodec>,
}

impl RawPeer {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Write bytes that bypass the frame codec
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    pub async fn next(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap()
    }

    /// Assert nothing arrives for `period`
    pub async fn expect_quiet(&mut self, period: Duration) {
        if let Ok(frame) = tokio::time::timeout(period, self.framed.next()).await {
            panic!("unexpected frame: {:?}", frame);
        }
    }
}

/// A client multiplexer connected to a raw peer
pub async fn connected_client(config: MuxConfig) -> (Multiplexer, RawPeer) {
    init_tracing();
    let network = MemoryNetwork::new();
    let remote = addr("10.1.0.1:9444");
    let listener = network.bind(remote).unwrap();

    let mux = Multiplexer::client(remote, config);
    mux.connect(&network.connector()).await.unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    (mux, RawPeer::new(stream))
}

pub type Events = mpsc::UnboundedReceiver<(IoEvent, Bytes)>;

/// Handler that forwards each event and the bytes received with it
pub fn collector() -> (impl IoHandler, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |event: IoEvent, vio: &mut Vio, _channel: &Channel| {
        let data = vio.buffer.split().freeze();
        let _ = tx.send((event, data));
    };
    (handler, rx)
}

pub fn ignore() -> impl IoHandler {
    |_event: IoEvent, _vio: &mut Vio, _channel: &Channel| {}
}

pub async fn next_event(events: &mut Events) -> (IoEvent, Bytes) {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("handler dropped")
}

/// Collect read events until `n` bytes have arrived
pub async fn read_bytes(events: &mut Events, n: usize) -> Bytes {
    let mut out = BytesMut::new();
    while out.len() < n {
        let (event, data) = next_event(events).await;
        assert!(
            matches!(event, IoEvent::ReadReady | IoEvent::ReadComplete),
            "unexpected event {:?}",
            event
        );
        out.extend_from_slice(&data);
    }
    out.freeze()
}
