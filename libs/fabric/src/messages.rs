//! Messages understood by the connection core itself, plus the
//! variable-length echo message used to exercise it.

use burrow_core::codec::{WireReader, WireWriter};
use burrow_core::{Errno, Error, Marshal, Mid, Result};

/// Handle to a file on the server, as returned by mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    pub control_fd: u64,
}

/// Payload of a [`Mid::ERROR`] response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResp {
    pub errno: Errno,
}

impl Marshal for ErrorResp {
    fn size_bytes(&self) -> usize {
        4
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        WireWriter::new(dst).put_u32(self.errno.code())
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let errno = Errno(WireReader::new(src).get_u32()?);
        Ok(Self { errno })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountReq {
    pub mount_path: String,
}

impl Marshal for MountReq {
    fn size_bytes(&self) -> usize {
        4 + self.mount_path.len()
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let len = u32::try_from(self.mount_path.len())
            .map_err(|_| Error::custom("mount path too long"))?;
        let mut w = WireWriter::new(dst);
        w.put_u32(len)?;
        w.put_bytes(self.mount_path.as_bytes())
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(src);
        let len = r.get_u32()? as usize;
        let bytes = r.get_bytes(len)?;
        let mount_path = std::str::from_utf8(bytes)
            .map_err(|e| Error::Codec(e.to_string()))?
            .to_string();
        Ok(Self { mount_path })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResp {
    pub root: Inode,
    pub max_message_size: u32,
    pub supported: Vec<Mid>,
}

impl Marshal for MountResp {
    fn size_bytes(&self) -> usize {
        8 + 4 + 2 + 2 * self.supported.len()
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let count = u16::try_from(self.supported.len())
            .map_err(|_| Error::custom("too many supported messages"))?;
        let mut w = WireWriter::new(dst);
        w.put_u64(self.root.control_fd)?;
        w.put_u32(self.max_message_size)?;
        w.put_u16(count)?;
        for mid in &self.supported {
            w.put_u16(mid.0)?;
        }
        Ok(())
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(src);
        let root = Inode {
            control_fd: r.get_u64()?,
        };
        let max_message_size = r.get_u32()?;
        let count = usize::from(r.get_u16()?);
        let mut supported = Vec::with_capacity(count.min(r.remaining() / 2));
        for _ in 0..count {
            supported.push(Mid(r.get_u16()?));
        }
        Ok(Self {
            root,
            max_message_size,
            supported,
        })
    }
}

/// Where a new channel lives inside the donated memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResp {
    pub data_offset: u64,
    pub data_length: u64,
}

impl Marshal for ChannelResp {
    fn size_bytes(&self) -> usize {
        16
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let mut w = WireWriter::new(dst);
        w.put_u64(self.data_offset)?;
        w.put_u64(self.data_length)
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(src);
        Ok(Self {
            data_offset: r.get_u64()?,
            data_length: r.get_u64()?,
        })
    }
}

/// Fixed-size element of [`MsgDynamic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgSimple {
    pub a: u16,
    pub b: u16,
    pub c: u32,
    pub d: u64,
    pub e: u64,
}

impl MsgSimple {
    pub const SIZE: usize = 24;

    fn write(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u16(self.a)?;
        w.put_u16(self.b)?;
        w.put_u32(self.c)?;
        w.put_u64(self.d)?;
        w.put_u64(self.e)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            a: r.get_u16()?,
            b: r.get_u16()?,
            c: r.get_u32()?,
            d: r.get_u64()?,
            e: r.get_u64()?,
        })
    }
}

impl Marshal for MsgSimple {
    fn size_bytes(&self) -> usize {
        Self::SIZE
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        self.write(&mut WireWriter::new(dst))
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        Self::read(&mut WireReader::new(src))
    }
}

/// Variable-length message: a `u16` count followed by that many
/// [`MsgSimple`] entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgDynamic {
    pub arr: Vec<MsgSimple>,
}

impl Marshal for MsgDynamic {
    fn size_bytes(&self) -> usize {
        2 + MsgSimple::SIZE * self.arr.len()
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let n = u16::try_from(self.arr.len())
            .map_err(|_| Error::custom("dynamic message has too many entries"))?;
        let mut w = WireWriter::new(dst);
        w.put_u16(n)?;
        self.arr.iter().try_for_each(|m| m.write(&mut w))
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(src);
        let n = usize::from(r.get_u16()?);
        let need = n * MsgSimple::SIZE;
        if r.remaining() < need {
            return Err(Error::Truncated {
                need: 2 + need,
                have: src.len(),
            });
        }
        let arr = (0..n)
            .map(|_| MsgSimple::read(&mut r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { arr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<M: Marshal>(m: &M) -> Vec<u8> {
        let mut buf = vec![0u8; m.size_bytes()];
        m.marshal_bytes(&mut buf).unwrap();
        buf
    }

    #[test]
    fn mount_resp_lists_supported_messages() {
        let resp = MountResp {
            root: Inode { control_fd: 1 },
            max_message_size: 4096,
            supported: vec![Mid::MOUNT, Mid::CHANNEL, Mid(5)],
        };
        let buf = encode(&resp);
        assert_eq!(buf.len(), 8 + 4 + 2 + 6);
        assert_eq!(MountResp::unmarshal_bytes(&buf).unwrap(), resp);
    }

    #[test]
    fn mount_req_rejects_bad_utf8() {
        let buf = [2, 0, 0, 0, 0xff, 0xfe];
        assert!(matches!(
            MountReq::unmarshal_bytes(&buf),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn dynamic_message_checks_declared_count() {
        let msg = MsgDynamic {
            arr: vec![MsgSimple::default(); 3],
        };
        let buf = encode(&msg);
        assert_eq!(buf.len(), 2 + 3 * MsgSimple::SIZE);
        assert!(matches!(
            MsgDynamic::unmarshal_bytes(&buf[..buf.len() - 1]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn empty_dynamic_message_is_two_bytes() {
        let buf = encode(&MsgDynamic::default());
        assert_eq!(buf, [0, 0]);
        assert!(MsgDynamic::unmarshal_bytes(&buf).unwrap().arr.is_empty());
    }
}
