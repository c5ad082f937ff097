use crate::mid::Mid;

/// Size of an encoded [`FrameHeader`].
pub const FRAME_HEADER_LEN: usize = 8;

/// Header preceding every payload.
///
/// Layout (little-endian): `payload_len: u32`, `mid: u16`, `num_fds: u16`.
/// Descriptors themselves travel out of band; `num_fds` lets the receiver
/// check that it got all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub mid: Mid,
    pub num_fds: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(mid: Mid, payload_len: u32) -> Self {
        Self {
            mid,
            num_fds: 0,
            payload_len,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.mid.0.to_le_bytes());
        out[6..8].copy_from_slice(&self.num_fds.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            mid: Mid(u16::from_le_bytes([buf[4], buf[5]])),
            num_fds: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let hdr = FrameHeader {
            mid: Mid(0x0102),
            num_fds: 2,
            payload_len: 0x0a0b0c0d,
        };
        assert_eq!(hdr.encode(), [0x0d, 0x0c, 0x0b, 0x0a, 0x02, 0x01, 0x02, 0x00]);
        assert_eq!(FrameHeader::decode(&hdr.encode()), hdr);
    }
}
