//! Frame header and message kinds

use crate::{HEADER_SIZE, MAX_PAYLOAD, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Channel identifier, scoped to one multiplexed connection
pub type ChannelId = i32;

/// Message kinds understood by the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    OpenChannel = 1,
    CloseChannel = 2,
    ShutdownWrite = 3,
    NormalData = 4,
    OobData = 5,
    ChannelReset = 6,
    FlowControlStart = 7,
    FlowControlStop = 8,
}

impl MessageType {
    /// Whether frames of this kind are followed by a body
    pub fn carries_payload(self) -> bool {
        matches!(self, MessageType::NormalData | MessageType::OobData)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::OpenChannel => "OPEN_CHANNEL",
            MessageType::CloseChannel => "CLOSE_CHANNEL",
            MessageType::ShutdownWrite => "SHUTDOWN_WRITE",
            MessageType::NormalData => "NORMAL_DATA",
            MessageType::OobData => "OOB_DATA",
            MessageType::ChannelReset => "CHANNEL_RESET",
            MessageType::FlowControlStart => "FLOW_CONTROL_START",
            MessageType::FlowControlStop => "FLOW_CONTROL_STOP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::OpenChannel),
            2 => Ok(MessageType::CloseChannel),
            3 => Ok(MessageType::ShutdownWrite),
            4 => Ok(MessageType::NormalData),
            5 => Ok(MessageType::OobData),
            6 => Ok(MessageType::ChannelReset),
            7 => Ok(MessageType::FlowControlStart),
            8 => Ok(MessageType::FlowControlStop),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Invalid frame length {len} for {msg_type}")]
    InvalidLength { msg_type: MessageType, len: u16 },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0} frames carry no payload")]
    UnexpectedPayload(MessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for framing operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: MessageType,
    /// Header plus payload length
    pub msg_len: u16,
    pub channel_id: ChannelId,
}

impl FrameHeader {
    pub fn new(
        msg_type: MessageType,
        channel_id: ChannelId,
        payload_len: usize,
    ) -> FrameResult<Self> {
        if payload_len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        if payload_len > 0 && !msg_type.carries_payload() {
            return Err(FrameError::UnexpectedPayload(msg_type));
        }

        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            msg_len: (HEADER_SIZE + payload_len) as u16,
            channel_id,
        })
    }

    /// Number of body bytes following the header
    pub fn payload_len(&self) -> usize {
        self.msg_len as usize - HEADER_SIZE
    }

    /// Encode header to bytes (Big Endian)
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u16(self.msg_len);
        buf.put_i32(self.channel_id);
        out
    }

    /// Append the encoded header to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&self.encode());
    }
}

/// Encode a header for a frame of the given kind
pub fn encode_header(
    msg_type: MessageType,
    channel_id: ChannelId,
    payload_len: usize,
) -> FrameResult<[u8; HEADER_SIZE]> {
    Ok(FrameHeader::new(msg_type, channel_id, payload_len)?.encode())
}

/// Decode a header from the front of `buf`
///
/// Returns Ok(None) if fewer than `HEADER_SIZE` bytes are available.
/// Nothing is consumed; the caller advances its own cursor.
pub fn decode_header(buf: &[u8]) -> FrameResult<Option<FrameHeader>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cursor = &buf[..HEADER_SIZE];
    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let msg_len = cursor.get_u16();
    let channel_id = cursor.get_i32();

    let len = msg_len as usize;
    let plausible = if msg_type.carries_payload() {
        len >= HEADER_SIZE
    } else {
        len == HEADER_SIZE
    };
    if !plausible {
        return Err(FrameError::InvalidLength {
            msg_type,
            len: msg_len,
        });
    }

    Ok(Some(FrameHeader {
        version,
        msg_type,
        msg_len,
        channel_id,
    }))
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, channel_id: ChannelId, payload: Bytes) -> Self {
        Self {
            msg_type,
            channel_id,
            payload,
        }
    }

    pub fn control(msg_type: MessageType, channel_id: ChannelId) -> Self {
        Self::new(msg_type, channel_id, Bytes::new())
    }

    pub fn data(channel_id: ChannelId, payload: Bytes) -> Self {
        Self::new(MessageType::NormalData, channel_id, payload)
    }

    pub fn header(&self) -> FrameResult<FrameHeader> {
        FrameHeader::new(self.msg_type, self.channel_id, self.payload.len())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> FrameResult<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> FrameResult<()> {
        let header = self.header()?;
        header.encode_into(dst);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `buf`, consuming it
    ///
    /// Returns Ok(None) and leaves `buf` untouched if the frame is incomplete.
    pub fn decode(buf: &mut BytesMut) -> FrameResult<Option<Self>> {
        let Some(header) = decode_header(buf)? else {
            return Ok(None);
        };

        let total = header.msg_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(header.payload_len()).freeze();

        Ok(Some(Self {
            msg_type: header.msg_type,
            channel_id: header.channel_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_LEN;

    #[test]
    fn test_header_layout() {
        let header = encode_header(MessageType::NormalData, 0x0102_0304, 5).unwrap();
        assert_eq!(header, [1, 4, 0, 13, 1, 2, 3, 4]);
    }

    #[test]
    fn test_frame_encode_decode() {
        let frames = [
            Frame::data(42, Bytes::from("hello world")),
            Frame::control(MessageType::OpenChannel, 7),
            Frame::control(MessageType::CloseChannel, -3),
            Frame::control(MessageType::FlowControlStop, i32::MAX),
            Frame::new(MessageType::OobData, 9, Bytes::from_static(b"!")),
        ];

        for frame in frames {
            let mut buf = BytesMut::from(&frame.encode().unwrap()[..]);
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_needs_more_data() {
        let encoded = Frame::data(1, Bytes::from("abcdef")).encode().unwrap();

        assert!(decode_header(&encoded[..HEADER_SIZE - 1]).unwrap().is_none());

        let mut partial = BytesMut::from(&encoded[..HEADER_SIZE + 2]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut raw = encode_header(MessageType::OpenChannel, 1, 0).unwrap();
        raw[0] = 9;
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut raw = encode_header(MessageType::OpenChannel, 1, 0).unwrap();
        raw[1] = 0;
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::InvalidMessageType(0))
        ));
    }

    #[test]
    fn test_decode_rejects_implausible_length() {
        // Data frame shorter than its own header
        let mut raw = encode_header(MessageType::NormalData, 1, 0).unwrap();
        raw[3] = 4;
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::InvalidLength { .. })
        ));

        // Control frame claiming a body
        let mut raw = encode_header(MessageType::CloseChannel, 1, 0).unwrap();
        raw[3] = 20;
        assert!(matches!(
            decode_header(&raw),
            Err(FrameError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_payload_limits() {
        assert!(FrameHeader::new(MessageType::NormalData, 1, MAX_PAYLOAD).is_ok());
        assert!(matches!(
            FrameHeader::new(MessageType::NormalData, 1, MAX_PAYLOAD + 1),
            Err(FrameError::PayloadTooLarge(_))
        ));
        assert!(matches!(
            Frame::new(MessageType::ChannelReset, 1, Bytes::from("x")).encode(),
            Err(FrameError::UnexpectedPayload(MessageType::ChannelReset))
        ));

        let full = FrameHeader::new(MessageType::NormalData, 1, MAX_PAYLOAD).unwrap();
        assert_eq!(full.msg_len as usize, MAX_FRAME_LEN);
    }
}
