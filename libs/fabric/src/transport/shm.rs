use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{fence, Ordering};

use burrow_core::{Errno, FrameHeader, Mid, FRAME_HEADER_LEN};

use crate::error::{Error, Result};
use crate::transport::{push_donation, Communicator, FdStream, FrameTransport};

/// Doorbell byte handing the region to the peer.
const DOORBELL: u8 = 1;

/// A shared, read-write mapping of part of a memory file.
pub(crate) struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned by this value and only touched through
// &self/&mut self. The peer process accesses it only while it holds the
// doorbell, never concurrently with us.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Maps `[offset, offset + len)` of `fd`. `offset` must be page aligned.
    pub(crate) fn map(fd: BorrowedFd<'_>, offset: u64, len: usize) -> io::Result<Self> {
        let offset =
            libc::off_t::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        // SAFETY: a fresh shared mapping; nothing else in this process
        // aliases the returned memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive local access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact range mapped in `map`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Communicator over a shared-memory channel.
///
/// The region starts with a [`FrameHeader`] followed by the payload. The
/// side holding the region writes a frame, then rings the doorbell socket;
/// the other side owns the region until it rings back. Descriptors ride on
/// the doorbell byte.
pub(crate) struct ChannelComm {
    region: SharedRegion,
    doorbell: FdStream,
    donated: Vec<OwnedFd>,
    received: Vec<OwnedFd>,
}

impl ChannelComm {
    pub(crate) fn new(region: SharedRegion, doorbell: FdStream) -> io::Result<Self> {
        if region.len() <= FRAME_HEADER_LEN {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(Self {
            region,
            doorbell,
            donated: Vec::new(),
            received: Vec::new(),
        })
    }

    /// Largest payload the region can hold.
    pub(crate) fn capacity(&self) -> u32 {
        u32::try_from(self.region.len() - FRAME_HEADER_LEN).unwrap_or(u32::MAX)
    }
}

impl Communicator for ChannelComm {
    fn payload_buf(&mut self, size: u32) -> &mut [u8] {
        let end = (FRAME_HEADER_LEN + size as usize).min(self.region.len());
        &mut self.region.as_mut_slice()[FRAME_HEADER_LEN..end]
    }

    fn add_donation_fd(&mut self, fd: OwnedFd) -> std::result::Result<(), Errno> {
        push_donation(&mut self.donated, fd)
    }

    fn take_received_fds(&mut self) -> Vec<OwnedFd> {
        mem::take(&mut self.received)
    }

    fn clear_donations(&mut self) {
        self.donated.clear();
    }
}

#[async_trait::async_trait]
impl FrameTransport for ChannelComm {
    async fn recv_frame(&mut self) -> Result<(Mid, u32)> {
        self.received.clear();

        let mut bell = [0u8; 1];
        self.doorbell.recv_exact(&mut bell, &mut self.received).await?;
        fence(Ordering::Acquire);

        let mut raw_hdr = [0u8; FRAME_HEADER_LEN];
        raw_hdr.copy_from_slice(&self.region.as_slice()[..FRAME_HEADER_LEN]);
        let hdr = FrameHeader::decode(&raw_hdr);
        if hdr.payload_len > self.capacity() {
            return Err(Error::InvalidFrame(format!(
                "payload of {} bytes exceeds channel capacity of {}",
                hdr.payload_len,
                self.capacity()
            )));
        }
        if self.received.len() != usize::from(hdr.num_fds) {
            return Err(Error::InvalidFrame(format!(
                "header announced {} descriptors, received {}",
                hdr.num_fds,
                self.received.len()
            )));
        }
        Ok((hdr.mid, hdr.payload_len))
    }

    async fn send_frame(&mut self, mid: Mid, payload_len: u32) -> Result<()> {
        let donated = mem::take(&mut self.donated);
        if payload_len > self.capacity() {
            return Err(Error::MessageTooLarge {
                size: payload_len as usize,
                max: self.capacity(),
            });
        }

        let hdr = FrameHeader {
            mid,
            num_fds: donated.len() as u16,
            payload_len,
        };
        self.region.as_mut_slice()[..FRAME_HEADER_LEN].copy_from_slice(&hdr.encode());
        fence(Ordering::Release);

        let fds: Vec<RawFd> = donated.iter().map(AsRawFd::as_raw_fd).collect();
        self.doorbell.send_all(&[[DOORBELL].as_slice()], &fds).await
    }

    fn shutdown(&self) {
        self.doorbell.shutdown();
    }
}
