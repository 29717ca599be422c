//! Connection lifecycle and per-channel remote-close bookkeeping

use std::fmt;

/// Lifecycle of a multiplexed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectState {
    NotConnected,
    ConnectIssued,
    WaitForReady,
    ConnectedActive,
    ConnectedIdle,
    ConnectedTeardown,
    Terminated,
    ConnectFailed,
    ConnectionDropped,
}

impl ConnectState {
    /// Whether the pool may hand out channels from a connection in this state
    pub fn is_reusable(self) -> bool {
        matches!(
            self,
            ConnectState::ConnectedActive | ConnectState::ConnectedIdle
        )
    }

    /// Whether frames may still be queued for the peer
    pub fn can_send(self) -> bool {
        matches!(
            self,
            ConnectState::ConnectedActive
                | ConnectState::ConnectedIdle
                | ConnectState::ConnectedTeardown
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectState::Terminated)
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::NotConnected => "NOT_CONNECTED",
            ConnectState::ConnectIssued => "CONNECT_ISSUED",
            ConnectState::WaitForReady => "WAIT_FOR_READY",
            ConnectState::ConnectedActive => "CONNECTED_ACTIVE",
            ConnectState::ConnectedIdle => "CONNECTED_IDLE",
            ConnectState::ConnectedTeardown => "CONNECTED_TEARDOWN",
            ConnectState::Terminated => "TERMINATED",
            ConnectState::ConnectFailed => "CONNECT_FAILED",
            ConnectState::ConnectionDropped => "CONNECTION_DROPPED",
        };
        f.write_str(name)
    }
}

/// Which end initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out; assigns channel ids
    Client,
    /// Accepted; takes channel ids from the peer
    Server,
}

/// What the peer has done to a channel, and which notifications are owed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteClose(u8);

impl RemoteClose {
    /// Peer sent CLOSE_CHANNEL or CHANNEL_RESET
    pub const CHANNEL_EVENT: u8 = 0b0000_0001;
    /// Peer sent SHUTDOWN_WRITE
    pub const WRITE_EVENT: u8 = 0b0000_0010;
    /// EOS owed to the reader
    pub const NEED_READ_NOTIFY: u8 = 0b0000_0100;
    /// ERROR owed to the writer
    pub const NEED_WRITE_NOTIFY: u8 = 0b0000_1000;

    pub const INBOUND_CLOSED: u8 = Self::CHANNEL_EVENT | Self::WRITE_EVENT;
    pub const OUTBOUND_CLOSED: u8 = Self::CHANNEL_EVENT;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    pub fn has(&self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    /// Peer will send no more data on this channel
    pub fn inbound_closed(&self) -> bool {
        self.has(Self::INBOUND_CLOSED)
    }

    /// Peer accepts no more data on this channel
    pub fn outbound_closed(&self) -> bool {
        self.has(Self::OUTBOUND_CLOSED)
    }

    /// Record a CLOSE_CHANNEL, CHANNEL_RESET or lost connection
    ///
    /// Notifications are only owed for halves that were still open.
    pub fn mark_closed(&mut self) {
        if !self.inbound_closed() {
            self.set(Self::NEED_READ_NOTIFY);
        }
        if !self.outbound_closed() {
            self.set(Self::NEED_WRITE_NOTIFY);
        }
        self.set(Self::CHANNEL_EVENT);
    }

    /// Record a SHUTDOWN_WRITE
    pub fn mark_write_shutdown(&mut self) {
        if !self.inbound_closed() {
            self.set(Self::WRITE_EVENT | Self::NEED_READ_NOTIFY);
        }
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}
