use crate::error::Result;

pub mod bincode;
pub mod raw;

pub use self::bincode::Bincode;
pub use self::raw::{WireReader, WireWriter};

/// Mapping between a message and its payload bytes.
///
/// `marshal_bytes` is always handed a buffer of exactly `size_bytes()`
/// bytes; `unmarshal_bytes` gets the payload as declared by the frame
/// header. Nothing is assumed about the layout, so self-describing and
/// variable-length messages are fine.
pub trait Marshal: Sized {
    /// Exact number of bytes `marshal_bytes` writes.
    fn size_bytes(&self) -> usize;

    /// Serialize into `dst`.
    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()>;

    /// Deserialize from `src`.
    fn unmarshal_bytes(src: &[u8]) -> Result<Self>;
}

/// Empty payload.
impl Marshal for () {
    fn size_bytes(&self) -> usize {
        0
    }

    fn marshal_bytes(&self, _dst: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn unmarshal_bytes(_src: &[u8]) -> Result<Self> {
        Ok(())
    }
}
