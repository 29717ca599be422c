//! Incremental frame parser for the demultiplex loop
//!
//! Unlike [`crate::FrameCodec`], the parser does not wait for a whole data
//! frame: body bytes are handed out as soon as they arrive so a slow
//! consumer never forces the connection to buffer a full 64 KiB frame.

use crate::frame::{decode_header, FrameHeader, FrameResult};
use crate::HEADER_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

/// One unit of progress through the inbound byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A header-only message
    Control(FrameHeader),
    /// A slice of a data frame body
    Data {
        header: FrameHeader,
        chunk: Bytes,
        /// First slice of this frame's body
        first: bool,
        /// Last slice of this frame's body
        last: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
enum ParseState {
    #[default]
    Header,
    Body {
        header: FrameHeader,
        remaining: usize,
        started: bool,
    },
}

#[derive(Debug, Default)]
pub struct FrameParser {
    state: ParseState,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance over `buf`, consuming what was parsed
    ///
    /// Returns Ok(None) when `buf` holds no complete header and no body
    /// bytes are owed. A header error leaves the parser unusable; the
    /// connection is expected to be dropped.
    pub fn poll(&mut self, buf: &mut BytesMut) -> FrameResult<Option<Parsed>> {
        loop {
            match self.state {
                ParseState::Header => {
                    let Some(header) = decode_header(buf)? else {
                        return Ok(None);
                    };
                    buf.advance(HEADER_SIZE);

                    trace!(
                        "frame {} channel={} len={}",
                        header.msg_type,
                        header.channel_id,
                        header.msg_len
                    );

                    if !header.msg_type.carries_payload() {
                        return Ok(Some(Parsed::Control(header)));
                    }

                    let remaining = header.payload_len();
                    if remaining == 0 {
                        // Empty data frame, nothing to deliver
                        continue;
                    }

                    self.state = ParseState::Body {
                        header,
                        remaining,
                        started: false,
                    };
                }
                ParseState::Body {
                    header,
                    remaining,
                    started,
                } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let take = remaining.min(buf.len());
                    let chunk = buf.split_to(take).freeze();
                    let left = remaining - take;

                    self.state = if left == 0 {
                        ParseState::Header
                    } else {
                        ParseState::Body {
                            header,
                            remaining: left,
                            started: true,
                        }
                    };

                    return Ok(Some(Parsed::Data {
                        header,
                        chunk,
                        first: !started,
                        last: left == 0,
                    }));
                }
            }
        }
    }

    /// Whether the parser is in the middle of a data frame body
    pub fn in_body(&self) -> bool {
        matches!(self.state, ParseState::Body { .. })
    }

    /// Body bytes still owed for the current data frame
    pub fn body_remaining(&self) -> usize {
        match self.state {
            ParseState::Body { remaining, .. } => remaining,
            ParseState::Header => 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::Header;
    }
}
