//! In-process transport over duplex pipes
//!
//! Used by tests to run both ends of a multiplexed connection inside one
//! runtime. The network counts connect attempts per address so callers can
//! assert how many physical connections were made.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    BoxedStream, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportStream,
};

const PIPE_CAPACITY: usize = 256 * 1024;

/// One end of an in-memory connection
#[derive(Debug)]
pub struct MemoryStream {
    inner: DuplexStream,
    local: SocketAddr,
    peer: SocketAddr,
}

impl MemoryStream {
    /// Create a connected pair
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (MemoryStream, MemoryStream) {
        let (x, y) = tokio::io::duplex(PIPE_CAPACITY);
        (
            MemoryStream {
                inner: x,
                local: a,
                peer: b,
            },
            MemoryStream {
                inner: y,
                local: b,
                peer: a,
            },
        )
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for MemoryStream {
    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.peer)
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<MemoryStream>>,
    connects: HashMap<SocketAddr, usize>,
    next_port: u16,
}

/// Registry of in-memory listeners
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener at `addr`
    pub fn bind(&self, addr: SocketAddr) -> TransportResult<MemoryListener> {
        let mut state = self.lock();
        if let Some(existing) = state.listeners.get(&addr) {
            if !existing.is_closed() {
                return Err(TransportError::BindError {
                    address: addr,
                    reason: "address in use".to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(addr, tx);
        debug!("Memory listener bound to {}", addr);

        Ok(MemoryListener {
            local: addr,
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            delay: None,
        }
    }

    /// Number of connect attempts made to `addr`
    pub fn connect_count(&self, addr: SocketAddr) -> usize {
        self.lock().connects.get(&addr).copied().unwrap_or(0)
    }

    fn open(&self, addr: SocketAddr) -> TransportResult<MemoryStream> {
        let mut state = self.lock();
        *state.connects.entry(addr).or_insert(0) += 1;

        let Some(tx) = state.listeners.get(&addr).cloned() else {
            return Err(TransportError::ConnectionError(format!(
                "connection refused: {}",
                addr
            )));
        };

        state.next_port = state.next_port.wrapping_add(1).max(1);
        let local = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            40000u16.wrapping_add(state.next_port),
        );
        drop(state);

        let (client, server) = MemoryStream::pair(local, addr);
        tx.send(server).map_err(|_| {
            TransportError::ConnectionError(format!("connection refused: {}", addr))
        })?;

        Ok(client)
    }
}

/// Connector into a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    delay: Option<Duration>,
}

impl MemoryConnector {
    /// Delay each connect, keeping it in flight for a while
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<BoxedStream> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let stream = self.network.open(addr)?;
        Ok(Box::new(stream))
    }
}

/// Listener side of a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryListener {
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<(BoxedStream, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        let stream = incoming.recv().await.ok_or(TransportError::ListenerClosed)?;
        let peer = stream.peer;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_connect_accept() {
        let network = MemoryNetwork::new();
        let addr: SocketAddr = "10.0.0.1:9444".parse().unwrap();
        let listener = network.bind(addr).unwrap();

        let mut client = network.connector().connect(addr).await.unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();

        assert_eq!(client.peer_addr().unwrap(), addr);
        assert_eq!(server.local_addr().unwrap(), addr);
        assert_eq!(peer, client.local_addr().unwrap());

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        assert_eq!(network.connect_count(addr), 1);
    }

    #[tokio::test]
    async fn test_memory_refused_counts_attempt() {
        let network = MemoryNetwork::new();
        let addr: SocketAddr = "10.0.0.2:9444".parse().unwrap();

        let result = network.connector().connect(addr).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
        assert_eq!(network.connect_count(addr), 1);
    }

    #[tokio::test]
    async fn test_memory_bind_twice() {
        let network = MemoryNetwork::new();
        let addr: SocketAddr = "10.0.0.3:1".parse().unwrap();
        let _listener = network.bind(addr).unwrap();
        assert!(matches!(
            network.bind(addr),
            Err(TransportError::BindError { .. })
        ));
    }
}
