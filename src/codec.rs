//! Length-prefixed framing: a little-endian `u32` length followed by the
//! payload. A zero-length frame marks the end of a stream.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::errors::GenerationError;

const LEN_PREFIX: usize = 4;

/// Largest payload the `u32` length prefix can describe.
pub const MAX_WIRE_FRAME_LEN: usize = u32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    End,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Limits above [`MAX_WIRE_FRAME_LEN`] are lowered to it.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_WIRE_FRAME_LEN),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = GenerationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, GenerationError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = LittleEndian::read_u32(&src[..LEN_PREFIX]) as usize;
        if len > self.max_frame_len {
            return Err(GenerationError::FrameTooLarge(len));
        }
        if len == 0 {
            src.advance(LEN_PREFIX);
            return Ok(Some(Frame::End));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        Ok(Some(Frame::Data(src.split_to(len).freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = GenerationError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), GenerationError> {
        match frame {
            Frame::End => dst.put_u32_le(0),
            Frame::Data(payload) => {
                if payload.is_empty() {
                    // An empty payload would read back as the end marker.
                    return Err(GenerationError::Config("cannot encode an empty data frame".to_string()));
                }
                if payload.len() > self.max_frame_len {
                    return Err(GenerationError::FrameTooLarge(payload.len()));
                }
                let len = u32::try_from(payload.len())
                    .map_err(|_| GenerationError::FrameTooLarge(payload.len()))?;
                dst.reserve(LEN_PREFIX + payload.len());
                dst.put_u32_le(len);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(b"hel");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"lo");
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"hello")))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::End));
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_length_prefix_and_end_marker() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Data(Bytes::from_static(b"abc")), &mut buf).unwrap();
        codec.encode(Frame::End, &mut buf).unwrap();
        assert_eq!(&buf[..], &[3, 0, 0, 0, b'a', b'b', b'c', 0, 0, 0, 0]);
    }

    #[test]
    fn rejects_oversize_frames() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&10u32.to_le_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(GenerationError::FrameTooLarge(10))));

        let mut out = BytesMut::new();
        let result = codec.encode(Frame::Data(Bytes::from_static(b"too long")), &mut out);
        assert!(matches!(result, Err(GenerationError::FrameTooLarge(8))));
    }

    #[test]
    fn frame_limit_never_exceeds_the_length_prefix() {
        assert_eq!(FrameCodec::new(usize::MAX).max_frame_len(), MAX_WIRE_FRAME_LEN);
        assert_eq!(FrameCodec::new(1024).max_frame_len(), 1024);
    }

    #[test]
    fn refuses_empty_data_frame() {
        let mut codec = FrameCodec::default();
        let mut out = BytesMut::new();
        assert!(codec.encode(Frame::Data(Bytes::new()), &mut out).is_err());
        assert!(out.is_empty());
    }
}
