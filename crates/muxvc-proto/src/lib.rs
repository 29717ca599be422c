//! Channel Multiplexing Protocol Definitions
//!
//! This crate defines the wire format shared by both ends of a multiplexed
//! connection: the fixed 8-byte frame header, the message kinds, an
//! incremental parser used by the demultiplex loop, and a whole-frame codec
//! for peers that work with complete frames.
//!
//! ```text
//! ┌─────────┬──────────┬──────────┬──────────────┐
//! │ version │ msg_type │ msg_len  │ channel_id   │
//! │ 1 byte  │ 1 byte   │ u16 BE   │ i32 BE       │
//! └─────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! `msg_len` counts the header as well as the payload. Only `NORMAL_DATA`
//! and `OOB_DATA` frames carry a payload.

pub mod codec;
pub mod frame;
pub mod parser;

pub use codec::FrameCodec;
pub use frame::{
    decode_header, encode_header, ChannelId, Frame, FrameError, FrameHeader, FrameResult,
    MessageType,
};
pub use parser::{FrameParser, Parsed};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 8;

/// Largest frame representable by the 16-bit length field
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest payload a single data frame can carry
pub const MAX_PAYLOAD: usize = MAX_FRAME_LEN - HEADER_SIZE;

/// Channel id meaning "not yet assigned"
pub const RESERVED_CHANNEL_ID: ChannelId = 0;
