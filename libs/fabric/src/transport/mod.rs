use std::os::fd::OwnedFd;

use burrow_core::{Errno, Mid};

use crate::error::Result;

mod shm;
mod unix;

pub(crate) use self::shm::{ChannelComm, SharedRegion};
pub(crate) use self::unix::{FdStream, SocketComm};

/// Most descriptors a single frame may carry.
pub const MAX_DONATED_FDS: usize = 16;

/// Transport-agnostic view of one framed exchange.
///
/// A communicator is driven by exactly one task at a time, so none of these
/// methods synchronize. Parallelism comes from having several of them.
pub trait Communicator: Send {
    /// Buffer of `size` bytes holding the current payload.
    ///
    /// The same memory is handed out on every call and stays valid until the
    /// next one, so reading a request and writing the response both go
    /// through here. Existing contents are kept when the buffer grows. On
    /// transports with a fixed capacity the slice is clamped to it.
    fn payload_buf(&mut self, size: u32) -> &mut [u8];

    /// Queues `fd` to be transferred with the next outgoing frame.
    ///
    /// The descriptor is closed locally once the frame is sent.
    fn add_donation_fd(&mut self, fd: OwnedFd) -> std::result::Result<(), Errno>;

    /// Descriptors that arrived with the frame currently being handled.
    fn take_received_fds(&mut self) -> Vec<OwnedFd>;

    /// Closes every descriptor queued with `add_donation_fd`.
    fn clear_donations(&mut self);
}

/// Frame-level send/receive on top of a [`Communicator`].
///
/// Both ends of a connection speak the same framing, so the server's service
/// loop and the client use the same implementations.
#[async_trait::async_trait]
pub(crate) trait FrameTransport: Communicator {
    /// Waits for the next frame; its payload is left in `payload_buf`.
    async fn recv_frame(&mut self) -> Result<(Mid, u32)>;

    /// Sends `payload_len` bytes of `payload_buf` along with queued donations.
    async fn send_frame(&mut self, mid: Mid, payload_len: u32) -> Result<()>;

    /// Tears down the underlying socket. Safe to call more than once.
    fn shutdown(&self);
}

pub(crate) fn push_donation(
    donated: &mut Vec<OwnedFd>,
    fd: OwnedFd,
) -> std::result::Result<(), Errno> {
    if donated.len() >= MAX_DONATED_FDS {
        return Err(Errno::EMFILE);
    }
    donated.push(fd);
    Ok(())
}
