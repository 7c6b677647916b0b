//! Wire frame codec: `message_id:u16`, `request_number:u16`,
//! `payload_size:u32`, `payload:bytes`, all big-endian (network byte
//! order).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MdvError;

pub const HEADER_LEN: usize = 2 + 2 + 4;

/// A request number of `0` marks a post with no expected response.
pub const NO_RESPONSE: u16 = 0;

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_id: u16,
    pub request_number: u16,
    pub payload: Bytes,
}

/// `payload_size` is capped by a configured constant (default 16 MiB);
/// larger frames fail the channel.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub max_payload: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec { max_payload: 16 * 1024 * 1024 }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MdvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MdvError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let payload_size = u32::from_be_bytes(src[4..8].try_into().unwrap());
        if payload_size > self.max_payload {
            return Err(MdvError::Failed(format!("frame payload {payload_size} exceeds max {}", self.max_payload)));
        }
        let frame_len = HEADER_LEN + payload_size as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let message_id = header.get_u16();
        let request_number = header.get_u16();
        let _payload_size = header.get_u32();
        let payload = src.split_to(payload_size as usize).freeze();

        Ok(Some(Frame { message_id, request_number, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MdvError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MdvError> {
        if frame.payload.len() as u64 > self.max_payload as u64 {
            return Err(MdvError::Failed(format!("frame payload {} exceeds max {}", frame.payload.len(), self.max_payload)));
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u16(frame.message_id);
        dst.put_u16(frame.request_number);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame { message_id: 7, request_number: 42, payload: Bytes::from_static(b"hello") };
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_id, 7);
        assert_eq!(decoded.request_number, 42);
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut codec = FrameCodec { max_payload: 4 };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
