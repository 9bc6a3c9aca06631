// Wire frame header and frame types for the link layer (§4.2 / §5 wire
// protocol). Header layout is fixed-width and hand-encoded (not bincode) so
// it is stable across versions and cheap to peek at without touching the
// payload: magic(2) | version(1) | type(1) | flags(2) | logical_stream_id(8)
// | seq(8) | length(4) = 26 bytes, payload follows.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{MeshError, Result};

pub const FRAME_MAGIC: u16 = 0xDB7E;
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 26;
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Hello,
    HelloAck,
    Data,
    Ack,
    Credit,
    Ping,
    Pong,
    Goodbye,
    RaftAppend,
    RaftVote,
    RaftSnapshot,
    Lsa,
}

impl FrameType {
    fn to_u8(self) -> u8 {
        match self {
            FrameType::Hello => 0,
            FrameType::HelloAck => 1,
            FrameType::Data => 2,
            FrameType::Ack => 3,
            FrameType::Credit => 4,
            FrameType::Ping => 5,
            FrameType::Pong => 6,
            FrameType::Goodbye => 7,
            FrameType::RaftAppend => 8,
            FrameType::RaftVote => 9,
            FrameType::RaftSnapshot => 10,
            FrameType::Lsa => 11,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => FrameType::Hello,
            1 => FrameType::HelloAck,
            2 => FrameType::Data,
            3 => FrameType::Ack,
            4 => FrameType::Credit,
            5 => FrameType::Ping,
            6 => FrameType::Pong,
            7 => FrameType::Goodbye,
            8 => FrameType::RaftAppend,
            9 => FrameType::RaftVote,
            10 => FrameType::RaftSnapshot,
            11 => FrameType::Lsa,
            other => return Err(MeshError::Serialization(format!("unknown frame type {other}"))),
        })
    }
}

/// Frame flags. `HAS_CHECKSUM` is set on every frame this crate emits; the
/// bit exists so a future version can drop the trailing crc32 without
/// breaking the header shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const HAS_CHECKSUM: FrameFlags = FrameFlags(0b0000_0001);
    const EMPTY: FrameFlags = FrameFlags(0);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits_truncate(bits: u16) -> Self {
        FrameFlags(bits & 0b0000_0001)
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;
    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        FrameFlags::EMPTY
    }
}

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub logical_stream_id: u64,
    pub seq: u64,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, logical_stream_id: u64, seq: u64, length: u32) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::HAS_CHECKSUM,
            logical_stream_id,
            seq,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.frame_type.to_u8());
        buf.put_u16(self.flags.bits());
        buf.put_u64(self.logical_stream_id);
        buf.put_u64(self.seq);
        buf.put_u32(self.length);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(MeshError::Serialization("short frame header".into()));
        }
        let mut cursor = buf;
        let magic = cursor.get_u16();
        if magic != FRAME_MAGIC {
            return Err(MeshError::Serialization(format!("bad frame magic {magic:#x}")));
        }
        let version = cursor.get_u8();
        if version != FRAME_VERSION {
            return Err(MeshError::Serialization(format!("unsupported frame version {version}")));
        }
        let frame_type = FrameType::from_u8(cursor.get_u8())?;
        let flags = FrameFlags::from_bits_truncate(cursor.get_u16());
        let logical_stream_id = cursor.get_u64();
        let seq = cursor.get_u64();
        let length = cursor.get_u32();
        Ok(Self { frame_type, flags, logical_stream_id, seq, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let header = FrameHeader::new(FrameType::Data, 42, 7, 128);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.logical_stream_id, 42);
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.length, 128);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xFFFF);
        buf.put_bytes(0, FRAME_HEADER_SIZE - 2);
        assert!(FrameHeader::decode(&buf).is_err());
    }
}
