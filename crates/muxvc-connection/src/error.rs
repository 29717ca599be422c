use crate::state::ConnectState;
use muxvc_proto::FrameError;
use muxvc_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    #[error("Connection not usable in state {0}")]
    NotConnected(ConnectState),

    #[error("Channel limit reached ({0})")]
    ChannelLimit(usize),

    #[error("Server connections do not open channels")]
    ServerRole,

    #[error("No free channel id")]
    ChannelIdsExhausted,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for multiplexer operations
pub type MuxResult<T> = Result<T, MuxError>;
