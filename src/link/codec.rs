// Frame encode/decode over the byte stream, adapted from the teacher's
// MessageCodec: fixed header, length-prefixed payload, trailing crc32 over
// the payload.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

use crate::error::{MeshError, Result};
use crate::link::frame::{FrameFlags, FrameHeader, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};

pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { max_payload: MAX_FRAME_PAYLOAD }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn encode(&self, frame_type: FrameType, logical_stream_id: u64, seq: u64, payload: &[u8]) -> Result<BytesMut> {
        if payload.len() > self.max_payload {
            return Err(MeshError::Serialization(format!(
                "frame payload too large: {} bytes (max {})",
                payload.len(),
                self.max_payload
            )));
        }

        let header = FrameHeader::new(frame_type, logical_stream_id, seq, payload.len() as u32);

        let mut hasher = Hasher::new();
        hasher.update(payload);
        let checksum = hasher.finalize();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len() + 4);
        header.encode(&mut buf);
        buf.put_slice(payload);
        buf.put_u32(checksum);
        Ok(buf)
    }

    /// Attempts to decode one complete frame from the front of `buf`. Returns
    /// `Ok(None)` when more bytes are needed; on success the consumed bytes
    /// are advanced out of `buf`.
    pub fn try_decode(&self, buf: &mut BytesMut) -> Result<Option<(FrameHeader, BytesMut)>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::decode(&buf[..FRAME_HEADER_SIZE])?;

        if header.length as usize > self.max_payload {
            return Err(MeshError::Serialization(format!(
                "peer frame too large: {} bytes (max {})",
                header.length, self.max_payload
            )));
        }

        let has_checksum = header.flags.contains(FrameFlags::HAS_CHECKSUM);
        let trailer = if has_checksum { 4 } else { 0 };
        let total = FRAME_HEADER_SIZE + header.length as usize + trailer;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize);

        if has_checksum {
            let received = buf.get_u32();
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let computed = hasher.finalize();
            if received != computed {
                return Err(MeshError::Serialization(format!(
                    "frame checksum mismatch: expected {computed}, got {received}"
                )));
            }
        }

        Ok(Some((header, payload)))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::frame::FrameType;

    #[test]
    fn encode_then_decode_recovers_payload() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(FrameType::Data, 1, 0, b"payload").unwrap();
        let (header, payload) = codec.try_decode(&mut encoded).unwrap().unwrap();
        assert_eq!(header.frame_type, FrameType::Data);
        assert_eq!(&payload[..], b"payload");
        assert!(encoded.is_empty());
    }

    #[test]
    fn partial_buffer_returns_none() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(FrameType::Ping, 0, 0, b"x").unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(codec.try_decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(FrameType::Data, 1, 0, b"payload").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(codec.try_decode(&mut encoded).is_err());
    }
}
