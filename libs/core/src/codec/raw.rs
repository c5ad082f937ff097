use crate::codec::Marshal;
use crate::error::{Error, Result};

/// Raw bytes: the payload is the whole buffer.
impl Marshal for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        WireWriter::new(dst).put_bytes(self)
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

/// Little-endian writer over a fixed buffer.
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        let have = self.buf.len();
        let dst = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(Error::Truncated { need: end, have })?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_bytes(&[v])
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }
}

/// Little-endian reader over a payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let bytes = self.buf.get(self.pos..end).ok_or(Error::Truncated {
            need: end,
            have: self.buf.len(),
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.get_array().map(u16::from_le_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.get_array().map(u32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.get_array().map(u64::from_le_bytes)
    }
}
