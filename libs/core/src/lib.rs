//! Burrow Core - Message framing and marshaling contract
//!
//! Every request and response exchanged over a burrow connection is a
//! frame: a fixed [`FrameHeader`] naming the operation ([`Mid`]) and the
//! payload length, followed by the payload bytes. Payload types implement
//! [`Marshal`], which is the only thing the transport layer knows about
//! them.
//!
//! # Example
//!
//! ```
//! use burrow_core::{Marshal, codec::WireWriter};
//!
//! struct Ping { seq: u32 }
//!
//! impl Marshal for Ping {
//!     fn size_bytes(&self) -> usize { 4 }
//!
//!     fn marshal_bytes(&self, dst: &mut [u8]) -> burrow_core::Result<()> {
//!         WireWriter::new(dst).put_u32(self.seq)
//!     }
//!
//!     fn unmarshal_bytes(src: &[u8]) -> burrow_core::Result<Self> {
//!         let mut r = burrow_core::codec::WireReader::new(src);
//!         Ok(Ping { seq: r.get_u32()? })
//!     }
//! }
//!
//! let mut buf = vec![0u8; Ping { seq: 7 }.size_bytes()];
//! Ping { seq: 7 }.marshal_bytes(&mut buf).unwrap();
//! assert_eq!(Ping::unmarshal_bytes(&buf).unwrap().seq, 7);
//! ```

pub mod codec;
pub mod errno;
pub mod error;
pub mod frame;
pub mod mid;

// Re-exports for convenience
pub use codec::Marshal;
pub use errno::Errno;
pub use error::{Error, Result};
pub use frame::{FrameHeader, FRAME_HEADER_LEN};
pub use mid::Mid;
