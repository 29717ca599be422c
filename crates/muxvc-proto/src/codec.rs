//! Whole-frame codec for tokio_util framing

use crate::frame::{Frame, FrameError};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for use with `tokio_util::codec::Framed`
///
/// Yields a frame only once its whole body has arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Frame::decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Reserve for the rest of a known frame
                if let Some(header) = crate::decode_header(src)? {
                    src.reserve((header.msg_len as usize).saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
