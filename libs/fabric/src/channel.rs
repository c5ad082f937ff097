use std::ffi::CStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use burrow_core::{Errno, FRAME_HEADER_LEN};
use tokio_util::sync::CancellationToken;

use crate::transport::{ChannelComm, FdStream, SharedRegion};

/// Location of a channel's region inside the connection's memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDesc {
    pub offset: u64,
    pub length: u64,
}

/// A freshly created channel, not yet serviced.
pub(crate) struct NewChannel {
    pub id: usize,
    pub comm: ChannelComm,
    pub desc: ChannelDesc,
    /// Peer end of the doorbell socket, donated to the client.
    pub client_doorbell: OwnedFd,
    pub shutdown: CancellationToken,
}

struct ChannelEntry {
    id: usize,
    desc: ChannelDesc,
    shutdown: CancellationToken,
}

/// Channels owned by one connection.
///
/// All regions are carved out of a single memory file at page-aligned
/// offsets. Live regions never overlap; the region of a released channel is
/// handed to the next channel of the same size.
#[derive(Default)]
pub(crate) struct ChannelSet {
    memfd: Option<OwnedFd>,
    next_offset: u64,
    next_id: usize,
    channels: Vec<ChannelEntry>,
    free: Vec<ChannelDesc>,
}

impl ChannelSet {
    /// Live channels.
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn descs(&self) -> Vec<ChannelDesc> {
        self.channels.iter().map(|c| c.desc).collect()
    }

    /// Creates a channel whose payload capacity is at least
    /// `max_message_size`. Anything acquired before a failure is released.
    pub(crate) fn create(
        &mut self,
        max_message_size: u32,
        max_channels: usize,
        parent: &CancellationToken,
    ) -> Result<NewChannel, Errno> {
        if self.channels.len() >= max_channels {
            return Err(Errno::ENOBUFS);
        }

        let length = region_len(max_message_size);
        let reuse = self.free.iter().position(|d| d.length == length as u64);
        let offset = reuse.map_or(self.next_offset, |i| self.free[i].offset);
        let memfd = match self.memfd.take() {
            Some(fd) => fd,
            None => create_memfd()?,
        };
        let mapped = match reuse {
            Some(_) => SharedRegion::map(memfd.as_fd(), offset, length),
            None => grow(&memfd, offset + length as u64)
                .and_then(|()| SharedRegion::map(memfd.as_fd(), offset, length)),
        };
        self.memfd = Some(memfd);
        let region = mapped?;

        let (server_end, client_end) = std::os::unix::net::UnixStream::pair()?;
        let comm = ChannelComm::new(region, FdStream::from_std(server_end)?)?;

        let desc = ChannelDesc {
            offset,
            length: length as u64,
        };
        match reuse {
            Some(i) => {
                self.free.swap_remove(i);
            }
            None => self.next_offset += length as u64,
        }
        let id = self.next_id;
        self.next_id += 1;
        let shutdown = parent.child_token();
        self.channels.push(ChannelEntry {
            id,
            desc,
            shutdown: shutdown.clone(),
        });

        Ok(NewChannel {
            id,
            comm,
            desc,
            client_doorbell: client_end.into(),
            shutdown,
        })
    }

    /// Forgets channel `id` and frees its slot and region. The caller must
    /// have stopped using the region. Returns false if it was already gone.
    pub(crate) fn release(&mut self, id: usize) -> bool {
        let Some(i) = self.channels.iter().position(|c| c.id == id) else {
            return false;
        };
        let entry = self.channels.remove(i);
        entry.shutdown.cancel();
        self.free.push(entry.desc);
        true
    }

    /// A new descriptor for the memory file, for donation.
    pub(crate) fn dup_memory(&self) -> Result<OwnedFd, Errno> {
        let memfd = self.memfd.as_ref().ok_or(Errno::EBADF)?;
        Ok(memfd.try_clone()?)
    }

    /// Marks every channel for teardown. Channels already gone are skipped.
    pub(crate) fn shutdown_all(&self) {
        for channel in &self.channels {
            channel.shutdown.cancel();
        }
    }
}

/// Header plus `max_message_size`, rounded up to whole pages.
fn region_len(max_message_size: u32) -> usize {
    let page = page_size();
    let want = FRAME_HEADER_LEN + max_message_size as usize;
    want.div_ceil(page) * page
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).ok().filter(|p| *p > 0).unwrap_or(4096)
}

fn create_memfd() -> io::Result<OwnedFd> {
    const NAME: &[u8] = b"burrow-channels\0";
    let name = CStr::from_bytes_with_nul(NAME).map_err(io::Error::other)?;
    // SAFETY: NUL-terminated name; on success the returned descriptor is ours.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn grow(memfd: &OwnedFd, len: u64) -> io::Result<()> {
    let len = libc::off_t::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
    // SAFETY: ftruncate on a descriptor we own.
    if unsafe { libc::ftruncate(memfd.as_raw_fd(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_page_multiples_with_room_for_the_header() {
        let page = page_size();
        assert_eq!(region_len(0), page);
        assert_eq!(region_len((page - FRAME_HEADER_LEN) as u32), page);
        assert_eq!(region_len((page - FRAME_HEADER_LEN + 1) as u32), 2 * page);
    }

    #[tokio::test]
    async fn channels_do_not_overlap() {
        let parent = CancellationToken::new();
        let mut set = ChannelSet::default();
        let a = set.create(4096, 4, &parent).unwrap();
        let b = set.create(4096, 4, &parent).unwrap();
        assert_eq!(a.desc.offset, 0);
        assert_eq!(b.desc.offset, a.desc.length);
        assert!(a.desc.length >= 4096 + FRAME_HEADER_LEN as u64);
        assert_eq!(set.len(), 2);
        assert_eq!(set.descs(), vec![a.desc, b.desc]);
    }

    #[tokio::test]
    async fn channel_limit_is_enforced() {
        let parent = CancellationToken::new();
        let mut set = ChannelSet::default();
        let _a = set.create(64, 1, &parent).unwrap();
        assert_eq!(set.create(64, 1, &parent).err(), Some(Errno::ENOBUFS));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_every_channel() {
        let parent = CancellationToken::new();
        let mut set = ChannelSet::default();
        let a = set.create(64, 2, &parent).unwrap();
        let b = set.create(64, 2, &parent).unwrap();
        parent.cancel();
        assert!(a.shutdown.is_cancelled());
        assert!(b.shutdown.is_cancelled());
        set.shutdown_all();
    }

    #[tokio::test]
    async fn released_slots_and_regions_are_reused() {
        let parent = CancellationToken::new();
        let mut set = ChannelSet::default();
        let a = set.create(4096, 2, &parent).unwrap();
        let b = set.create(4096, 2, &parent).unwrap();
        assert_eq!(set.create(4096, 2, &parent).err(), Some(Errno::ENOBUFS));

        drop(a.comm);
        assert!(set.release(a.id));
        assert!(a.shutdown.is_cancelled());
        assert!(!set.release(a.id));
        assert_eq!(set.len(), 1);

        let c = set.create(4096, 2, &parent).unwrap();
        assert_ne!(c.id, a.id);
        assert_eq!(c.desc, a.desc);
        assert_eq!(set.descs(), vec![b.desc, c.desc]);
    }

    #[tokio::test]
    async fn regions_of_another_size_are_not_reused() {
        let parent = CancellationToken::new();
        let mut set = ChannelSet::default();
        let small = set.create(64, 4, &parent).unwrap();
        assert!(set.release(small.id));

        let big = set.create(64 * 1024, 4, &parent).unwrap();
        assert_eq!(big.desc.offset, small.desc.length);
    }

    #[test]
    fn no_memory_to_dup_before_first_channel() {
        assert_eq!(ChannelSet::default().dup_memory().err(), Some(Errno::EBADF));
    }
}
