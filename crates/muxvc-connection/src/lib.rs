//! Multiplexed virtual connections
//!
//! Many independent byte-stream [`Channel`]s share one transport connection
//! to a peer. A [`ConnectionPool`] finds or creates the [`Multiplexer`] for a
//! remote address and hands out channels; a [`MuxListener`] accepts the
//! peer side.
//!
//! ```text
//!  ConnectionPool ──get_connection──► PendingConnect ──► Channel
//!        │                                                 │
//!        └── Multiplexer (one per connection) ◄────────────┘
//!              │ reader task: parse frames, demultiplex
//!              │ writer task: drain outbound buffer
//!              ▼
//!        TransportStream
//! ```
//!
//! Consumers drive channels with `read`/`write` and receive progress through
//! an [`IoHandler`]. Bytes a reader is not ready for are held in a per-channel
//! byte bank and always delivered before newer bytes.

pub mod bank;
pub mod channel;
pub mod config;
pub mod error;
pub mod listener;
pub mod multiplexer;
pub mod pending;
pub mod pool;
mod retry;
pub mod state;
pub mod vio;

pub use channel::Channel;
pub use config::{MuxConfig, DEFAULT_CHANNEL_LIMIT, DEFAULT_PORT};
pub use error::{MuxError, MuxResult};
pub use listener::MuxListener;
pub use multiplexer::Multiplexer;
pub use pending::PendingConnect;
pub use pool::ConnectionPool;
pub use state::{ConnectState, Role};
pub use vio::{IoEvent, IoHandler, ShutdownHow, Vio, VioOp};
