use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Marshal;
use crate::error::{Error, Result};

/// Bincode adapter for serde types
///
/// The value is encoded once on construction so that `size_bytes` is exact
/// and `marshal_bytes` is a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Bincode<T> {
    value: T,
    encoded: Vec<u8>,
}

impl<T: Serialize + DeserializeOwned> Bincode<T> {
    pub fn new(value: T) -> Result<Self> {
        let encoded = bincode::serialize(&value).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Self { value, encoded })
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Serialize + DeserializeOwned> Marshal for Bincode<T> {
    fn size_bytes(&self) -> usize {
        self.encoded.len()
    }

    fn marshal_bytes(&self, dst: &mut [u8]) -> Result<()> {
        let (need, have) = (self.encoded.len(), dst.len());
        let dst = dst.get_mut(..need).ok_or(Error::Truncated { need, have })?;
        dst.copy_from_slice(&self.encoded);
        Ok(())
    }

    fn unmarshal_bytes(src: &[u8]) -> Result<Self> {
        let value = bincode::deserialize(src).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Self {
            value,
            encoded: src.to_vec(),
        })
    }
}
