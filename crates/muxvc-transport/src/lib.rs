//! Transport abstraction for multiplexed connections
//!
//! The multiplexer only needs a reliable, ordered byte stream. This crate
//! defines the traits it talks to and two implementations:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              muxvc-connection               │
//! │     (Multiplexer, ConnectionPool, ...)      │
//! └─────────────────────────────────────────────┘
//!                       │ uses traits
//!                       ↓
//! ┌─────────────────────────────────────────────┐
//! │  TransportConnector / TransportListener     │
//! │            TransportStream                  │
//! └─────────────────────────────────────────────┘
//!                       │ implemented by
//!            ┌──────────┴──────────┐
//!            ↓                     ↓
//!       tcp (tokio::net)     memory (duplex pipes)
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryConnector, MemoryListener, MemoryNetwork, MemoryStream};
pub use tcp::{TcpConnector, TcpTransportListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A reliable, ordered, bidirectional byte stream
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + Debug {
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    fn peer_addr(&self) -> TransportResult<SocketAddr>;
}

/// Boxed stream handed to the multiplexer
pub type BoxedStream = Box<dyn TransportStream>;

/// Establishes outbound streams
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<BoxedStream>;
}

/// Accepts inbound streams
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Wait for the next inbound stream
    async fn accept(&self) -> TransportResult<(BoxedStream, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;
}
