//! TCP transport

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    BoxedStream, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportStream,
};

impl TransportStream for TcpStream {
    fn local_addr(&self) -> TransportResult<SocketAddr> {
        TcpStream::local_addr(self).map_err(TransportError::IoError)
    }

    fn peer_addr(&self) -> TransportResult<SocketAddr> {
        TcpStream::peer_addr(self).map_err(TransportError::IoError)
    }
}

/// TCP connector for outbound multiplexed connections
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<BoxedStream> {
        debug!("Connecting to {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
            }
        }

        Ok(Box::new(stream))
    }
}

/// TCP listener for inbound multiplexed connections
pub struct TcpTransportListener {
    tcp_listener: TcpListener,
}

impl std::fmt::Debug for TcpTransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .finish()
    }
}

impl TcpTransportListener {
    pub fn bind(bind_addr: SocketAddr) -> TransportResult<Self> {
        // Create TCP listener synchronously using std
        let std_listener =
            std::net::TcpListener::bind(bind_addr).map_err(|e| TransportError::BindError {
                address: bind_addr,
                reason: e.to_string(),
            })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener).map_err(TransportError::IoError)?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!("Mux listener bound to {}", local_addr);

        Ok(Self { tcp_listener })
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> TransportResult<(BoxedStream, SocketAddr)> {
        let (stream, remote_addr) = self
            .tcp_listener
            .accept()
            .await
            .map_err(TransportError::IoError)?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        debug!("Incoming TCP connection from {}", remote_addr);
        Ok((Box::new(stream), remote_addr))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }
}
