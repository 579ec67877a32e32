//! Frame reassembly for the length-prefixed TCP stream.

use crate::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header length: 4-byte big-endian message length prefix.
pub const HEADER_LEN: usize = 4;

/// Maximum accepted frame payload. Oversized lengths fail the stream
/// instead of letting a corrupt prefix drive unbounded allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length-prefixed frame codec.
///
/// Decoding preserves partial frames across reads: short input emits
/// nothing and leaves the buffer intact, and consumed frames are
/// advanced out of the buffer so the tail never accumulates.
/// Zero-length frames are legal and decode to an empty payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            // Partial frame: reserve what the rest needs and wait.
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(item.len()));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();

        let payload = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_arbitrary_chunking_preserves_sequence() {
        // Three frames concatenated, then fed one byte at a time.
        let mut wire = Vec::new();
        let payloads: [&[u8]; 3] = [b"alpha", b"", b"gamma-ray"];
        for p in payloads {
            wire.extend_from_slice(&framed(p));
        }

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let mut out: Vec<Bytes> = Vec::new();
        for byte in wire {
            buf.put_u8(byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame);
            }
        }

        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], b"alpha");
        assert_eq!(&out[1][..], b"");
        assert_eq!(&out[2][..], b"gamma-ray");
    }

    #[test]
    fn test_partial_frame_emits_nothing() {
        let mut codec = FrameCodec;
        let wire = framed(b"partial-payload");

        let mut buf = BytesMut::from(&wire[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // State preserved: completing the frame emits it.
        buf.extend_from_slice(&wire[7..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"partial-payload");
    }

    #[test]
    fn test_zero_length_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&framed(b"")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_header_waits() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&u32::MAX.to_be_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_buffer_does_not_accumulate_after_emission() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for _ in 0..1000 {
            buf.extend_from_slice(&framed(&[0xAB; 64]));
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.len(), 64);
            assert!(buf.is_empty());
        }
    }
}
