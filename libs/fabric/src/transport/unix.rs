use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use burrow_core::{Errno, FrameHeader, Mid, FRAME_HEADER_LEN};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::transport::{push_donation, Communicator, FrameTransport, MAX_DONATED_FDS};

/// Control message buffer, `u64` for `cmsghdr` alignment. Comfortably
/// larger than `CMSG_SPACE` for `MAX_DONATED_FDS` descriptors.
type CmsgBuf = [u64; 32];

/// Unix stream that can carry descriptors alongside bytes.
///
/// Descriptors are attached as `SCM_RIGHTS` to the first `sendmsg` of a
/// write and collected from every `recvmsg` of a read.
pub(crate) struct FdStream {
    stream: UnixStream,
}

impl FdStream {
    /// Wraps a std socket. Must be called from within a Tokio runtime.
    pub(crate) fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(stream)?,
        })
    }

    /// Writes every byte of `bufs`, donating `fds` with the first chunk.
    pub(crate) async fn send_all(&self, bufs: &[&[u8]], fds: &[RawFd]) -> Result<()> {
        if fds.len() > MAX_DONATED_FDS {
            return Err(Error::InvalidFrame(format!(
                "cannot donate {} descriptors, limit is {MAX_DONATED_FDS}",
                fds.len()
            )));
        }
        let raw = self.stream.as_raw_fd();
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut sent = 0;
        let mut fds = fds;
        while sent < total {
            let iov = remaining_slices(bufs, sent);
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || try_send(raw, &iov, fds))
                .await
                .map_err(map_io)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            sent += n;
            fds = &[];
        }
        Ok(())
    }

    /// Fills `buf` completely, appending received descriptors to `fds`.
    pub(crate) async fn recv_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<()> {
        let raw = self.stream.as_raw_fd();
        let mut read = 0;
        while read < buf.len() {
            let n = self
                .stream
                .async_io(Interest::READABLE, || try_recv(raw, &mut buf[read..], fds))
                .await
                .map_err(map_io)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            read += n;
        }
        Ok(())
    }

    /// Shuts down both directions. Errors from an already shut down socket
    /// are expected and ignored.
    pub(crate) fn shutdown(&self) {
        // SAFETY: shutdown(2) on a descriptor we own.
        unsafe {
            libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

fn map_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
        _ => Error::Io(err),
    }
}

fn remaining_slices<'a>(bufs: &[&'a [u8]], mut skip: usize) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.push(IoSlice::new(&buf[skip..]));
        skip = 0;
    }
    out
}

/// One `sendmsg`. May fail with `WouldBlock`.
fn try_send(socket: RawFd, iov: &[IoSlice<'_>], fds: &[RawFd]) -> io::Result<usize> {
    let mut cmsg_buf: CmsgBuf = [0; 32];
    // SAFETY: msghdr is plain old data.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = iov.as_ptr() as *mut libc::iovec;
    hdr.msg_iovlen = iov.len() as _;

    if !fds.is_empty() {
        let data_len = mem::size_of_val(fds) as libc::c_uint;
        // SAFETY: the control buffer is aligned for cmsghdr and large enough
        // for MAX_DONATED_FDS descriptors, which send_all enforces.
        unsafe {
            hdr.msg_control = cmsg_buf.as_mut_ptr().cast();
            hdr.msg_controllen = libc::CMSG_SPACE(data_len) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
            ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                fds.len(),
            );
        }
    }

    // SAFETY: every pointer in hdr refers to live, initialized buffers.
    let n = unsafe { libc::sendmsg(socket, &hdr, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One `recvmsg`. Received descriptors are owned (and close-on-exec) before
/// any error is reported, so nothing leaks. May fail with `WouldBlock`.
fn try_recv(socket: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut cmsg_buf: CmsgBuf = [0; 32];
    let mut iov = [IoSliceMut::new(buf)];
    // SAFETY: msghdr is plain old data.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = iov.as_mut_ptr().cast::<libc::iovec>();
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr().cast();
    hdr.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

    // SAFETY: every pointer in hdr refers to live buffers of the stated size.
    let n = unsafe { libc::recvmsg(socket, &mut hdr, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: walking control messages the kernel just wrote into cmsg_buf.
    // Every SCM_RIGHTS descriptor now belongs to this process.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..data_len / mem::size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }

    if hdr.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
    }
    Ok(n as usize)
}

/// Communicator over the control socket.
///
/// Frames are the encoded header followed by the payload; descriptors ride
/// on the header bytes.
pub(crate) struct SocketComm {
    stream: FdStream,
    buf: Vec<u8>,
    max_payload: u32,
    donated: Vec<OwnedFd>,
    received: Vec<OwnedFd>,
}

impl SocketComm {
    pub(crate) fn new(stream: FdStream, max_payload: u32) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            max_payload,
            donated: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Largest payload accepted from the peer or handed out by
    /// `payload_buf`. Both ends use the negotiated size.
    pub(crate) fn set_max_payload(&mut self, max_payload: u32) {
        self.max_payload = max_payload;
    }

    fn ensure_len(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }
}

impl Communicator for SocketComm {
    fn payload_buf(&mut self, size: u32) -> &mut [u8] {
        let size = size.min(self.max_payload) as usize;
        self.ensure_len(size);
        &mut self.buf[..size]
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
impl FrameTransport for SocketComm {
    async fn recv_frame(&mut self) -> Result<(Mid, u32)> {
        self.received.clear();

        let mut raw_hdr = [0u8; FRAME_HEADER_LEN];
        self.stream.recv_exact(&mut raw_hdr, &mut self.received).await?;
        let hdr = FrameHeader::decode(&raw_hdr);
        if hdr.payload_len > self.max_payload {
            return Err(Error::InvalidFrame(format!(
                "payload of {} bytes exceeds maximum of {}",
                hdr.payload_len, self.max_payload
            )));
        }

        let len = hdr.payload_len as usize;
        self.ensure_len(len);
        self.stream
            .recv_exact(&mut self.buf[..len], &mut self.received)
            .await?;

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
        // Taken so the descriptors are closed however the send ends.
        let donated = mem::take(&mut self.donated);
        if payload_len > self.max_payload {
            return Err(Error::MessageTooLarge {
                size: payload_len as usize,
                max: self.max_payload,
            });
        }
        let len = payload_len as usize;
        self.ensure_len(len);

        let hdr = FrameHeader {
            mid,
            num_fds: donated.len() as u16,
            payload_len,
        };
        let raw_hdr = hdr.encode();
        let fds: Vec<RawFd> = donated.iter().map(AsRawFd::as_raw_fd).collect();
        self.stream
            .send_all(&[raw_hdr.as_slice(), &self.buf[..len]], &fds)
            .await
    }

    fn shutdown(&self) {
        self.stream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pair() -> (FdStream, FdStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        (FdStream::from_std(a).unwrap(), FdStream::from_std(b).unwrap())
    }

    #[test]
    fn remaining_slices_skips_consumed_bytes() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        let iov = remaining_slices(&[a.as_slice(), b.as_slice()], 4);
        assert_eq!(iov.len(), 1);
        assert_eq!(&*iov[0], &[5]);

        let iov = remaining_slices(&[a.as_slice(), b.as_slice()], 1);
        assert_eq!(iov.len(), 2);
        assert_eq!(&*iov[0], &[2, 3]);
    }

    #[tokio::test]
    async fn descriptors_travel_with_bytes() {
        let (left, right) = pair();
        let (mut keep, donate) = std::os::unix::net::UnixStream::pair().unwrap();

        left.send_all(&[b"hi".as_slice()], &[donate.as_raw_fd()]).await.unwrap();
        drop(donate);

        let mut buf = [0u8; 2];
        let mut fds = Vec::new();
        right.recv_exact(&mut buf, &mut fds).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(fds.len(), 1);

        // The received descriptor is the other end of `keep`.
        let mut received = std::os::unix::net::UnixStream::from(fds.pop().unwrap());
        received.write_all(b"ok").unwrap();
        let mut reply = [0u8; 2];
        keep.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");
    }

    #[tokio::test]
    async fn socket_frames_round_trip() {
        let (left, right) = pair();
        let mut client = SocketComm::new(left, 1024);
        let mut server = SocketComm::new(right, 1024);

        client.payload_buf(5).copy_from_slice(b"hello");
        client.send_frame(Mid(7), 5).await.unwrap();

        let (mid, len) = server.recv_frame().await.unwrap();
        assert_eq!((mid, len), (Mid(7), 5));
        assert_eq!(server.payload_buf(len), b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (left, right) = pair();
        let mut client = SocketComm::new(left, 1 << 20);
        let mut server = SocketComm::new(right, 16);

        client.payload_buf(64).fill(0xab);
        client.send_frame(Mid(7), 64).await.unwrap();

        match server.recv_frame().await {
            Err(Error::InvalidFrame(msg)) => assert!(msg.contains("exceeds")),
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn payload_buf_is_clamped_to_the_bound() {
        let (left, _right) = pair();
        let mut comm = SocketComm::new(left, 16);
        assert_eq!(comm.payload_buf(64).len(), 16);
        assert_eq!(comm.payload_buf(8).len(), 8);
        assert!(matches!(
            comm.send_frame(Mid(7), 64).await,
            Err(Error::MessageTooLarge { size: 64, max: 16 })
        ));
    }

    #[tokio::test]
    async fn peer_close_reports_connection_closed() {
        let (left, right) = pair();
        let mut server = SocketComm::new(right, 16);
        drop(left);

        assert!(matches!(
            server.recv_frame().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (left, _right) = pair();
        left.shutdown();
        left.shutdown();
    }
}
