use std::mem;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use burrow_core::{Marshal, Mid};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::messages::{ChannelResp, Inode, MountReq, MountResp};
use crate::exchange::exchange;
use crate::server::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::{ChannelComm, FdStream, FrameTransport, SharedRegion, SocketComm};

/// Default number of channels a client opens on demand.
pub const DEFAULT_CLIENT_CHANNELS: usize = 16;

/// Client end of a connection.
///
/// Calls may be issued from any number of tasks at once. Each call uses an
/// idle channel, opens a new one while under the limit, or otherwise takes
/// the control socket for the duration of the exchange.
pub struct Client {
    socket: tokio::sync::Mutex<ClientSocket>,
    pool: Mutex<ChannelPool>,
    supported: Vec<bool>,
    max_message_size: u32,
    max_channels: usize,
    closed: AtomicBool,
}

struct ClientSocket {
    comm: SocketComm,
    /// Set while an exchange is in flight. Still set afterwards means the
    /// exchange was abandoned halfway and request/response pairing is lost.
    poisoned: bool,
}

#[derive(Default)]
struct ChannelPool {
    idle: Vec<ChannelComm>,
    /// Channels in existence, idle or leased.
    open: usize,
    /// The server refused a channel; stop asking.
    exhausted: bool,
}

impl Client {
    /// Create a builder for configuring the client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Mounts `mount_path` over `socket` with default settings.
    pub async fn connect(socket: UnixStream, mount_path: &str) -> Result<(Self, Inode)> {
        Self::builder().connect(socket, mount_path).await
    }

    /// Whether the server has a handler for `mid`.
    pub fn is_supported(&self, mid: Mid) -> bool {
        self.supported.get(mid.index()).copied().unwrap_or(false)
    }

    /// Negotiated maximum payload size.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Channels currently open, idle or in use.
    pub fn channel_count(&self) -> usize {
        self.pool.lock().open
    }

    /// Sends `req` as message `mid` and waits for the response.
    ///
    /// `donate` is transferred to the server with the request; descriptors
    /// the server donated come back with the response. An unsupported `mid`
    /// fails with [`Error::Remote`] carrying `EOPNOTSUPP`.
    pub async fn snd_rcv_message<Req, Resp>(
        &self,
        mid: Mid,
        req: &Req,
        donate: Vec<OwnedFd>,
    ) -> Result<(Resp, Vec<OwnedFd>)>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let size = req.size_bytes();
        if size > self.max_message_size as usize {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        if let Some(mut lease) = self.lease_channel().await {
            return lease.exchange(mid, req, donate).await;
        }
        self.socket_exchange(mid, req, donate).await
    }

    /// Shuts down the control socket and every idle channel, which ends the
    /// connection on the server. Calls in flight finish or fail; later calls
    /// fail with [`Error::Shutdown`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = {
            let mut pool = self.pool.lock();
            let idle = mem::take(&mut pool.idle);
            pool.open -= idle.len();
            idle
        };
        for channel in &idle {
            channel.shutdown();
        }
        drop(idle);

        let socket = self.socket.lock().await;
        socket.comm.shutdown();
    }

    async fn socket_exchange<Req, Resp>(
        &self,
        mid: Mid,
        req: &Req,
        donate: Vec<OwnedFd>,
    ) -> Result<(Resp, Vec<OwnedFd>)>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        let mut socket = self.socket.lock().await;
        if socket.poisoned {
            return Err(Error::ConnectionClosed);
        }
        socket.poisoned = true;
        let result = exchange(&mut socket.comm, mid, req, donate).await;
        if !matches!(&result, Err(err) if err.is_transport()) {
            socket.poisoned = false;
        }
        result
    }

    async fn lease_channel(&self) -> Option<ChannelLease<'_>> {
        let mut lease = {
            let mut pool = self.pool.lock();
            if let Some(channel) = pool.idle.pop() {
                return Some(ChannelLease::new(self, Some(channel)));
            }
            if pool.exhausted
                || pool.open >= self.max_channels
                || !self.is_supported(Mid::CHANNEL)
            {
                return None;
            }
            // Reserve the slot before opening outside the lock. The lease
            // gives it back if opening fails or is cancelled.
            pool.open += 1;
            ChannelLease::new(self, None)
        };

        match self.open_channel().await {
            Ok(channel) => {
                lease.channel = Some(channel);
                Some(lease)
            }
            Err(err) => {
                debug!(error = %err, "channel unavailable, using the control socket");
                self.pool.lock().exhausted = true;
                None
            }
        }
    }

    fn return_channel(&self, channel: ChannelComm, broken: bool) {
        let mut pool = self.pool.lock();
        if broken || self.closed.load(Ordering::Acquire) {
            pool.open -= 1;
            // The server frees the slot once it sees the channel close.
            pool.exhausted = false;
            drop(pool);
            channel.shutdown();
            return;
        }
        pool.idle.push(channel);
    }

    fn release_slot(&self) {
        self.pool.lock().open -= 1;
    }

    async fn open_channel(&self) -> Result<ChannelComm> {
        let (resp, fds): (ChannelResp, _) =
            self.socket_exchange(Mid::CHANNEL, &(), Vec::new()).await?;
        let [data_fd, doorbell]: [OwnedFd; 2] = fds.try_into().map_err(|fds: Vec<OwnedFd>| {
            Error::InvalidFrame(format!(
                "channel response carried {} descriptors, expected 2",
                fds.len()
            ))
        })?;

        let length = usize::try_from(resp.data_length)
            .map_err(|_| Error::InvalidFrame("channel region too large".into()))?;
        let region = SharedRegion::map(data_fd.as_fd(), resp.data_offset, length)?;
        let doorbell = FdStream::from_std(UnixStream::from(doorbell))?;
        let channel = ChannelComm::new(region, doorbell)?;
        if channel.capacity() < self.max_message_size {
            return Err(Error::InvalidFrame(format!(
                "channel capacity {} is below the negotiated maximum {}",
                channel.capacity(),
                self.max_message_size
            )));
        }
        debug!(offset = resp.data_offset, length, "opened channel");
        Ok(channel)
    }
}

/// A channel checked out of the pool for one call.
///
/// Dropping the lease puts the channel back. A call that did not finish,
/// including one whose future was dropped, leaves the channel mid-exchange,
/// so it is discarded instead.
struct ChannelLease<'a> {
    client: &'a Client,
    /// `None` while the reserved slot is still being opened.
    channel: Option<ChannelComm>,
    broken: bool,
}

impl<'a> ChannelLease<'a> {
    fn new(client: &'a Client, channel: Option<ChannelComm>) -> Self {
        Self {
            client,
            channel,
            broken: true,
        }
    }

    async fn exchange<Req, Resp>(
        &mut self,
        mid: Mid,
        req: &Req,
        donate: Vec<OwnedFd>,
    ) -> Result<(Resp, Vec<OwnedFd>)>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        let channel = self.channel.as_mut().ok_or(Error::ConnectionClosed)?;
        self.broken = true;
        let result = exchange(channel, mid, req, donate).await;
        self.broken = matches!(&result, Err(err) if err.is_transport());
        result
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        match self.channel.take() {
            Some(channel) => self.client.return_channel(channel, self.broken),
            None => self.client.release_slot(),
        }
    }
}

/// Builder for configuring a [`Client`]
pub struct ClientBuilder {
    max_channels: usize,
    max_message_size: u32,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_CLIENT_CHANNELS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many channels the client may open; 0 keeps every call on the
    /// control socket
    pub fn max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// Set the largest frame accepted before the mount response negotiates
    /// the real limit
    pub fn max_message_size(mut self, max_message_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Mounts `mount_path` over `socket`. Must be called from within a Tokio
    /// runtime.
    pub async fn connect(self, socket: UnixStream, mount_path: &str) -> Result<(Client, Inode)> {
        let stream = FdStream::from_std(socket)?;
        let mut comm = SocketComm::new(stream, self.max_message_size);

        let req = MountReq {
            mount_path: mount_path.to_string(),
        };
        let (resp, _): (MountResp, _) = exchange(&mut comm, Mid::MOUNT, &req, Vec::new()).await?;
        comm.set_max_payload(resp.max_message_size);

        let mut supported = Vec::new();
        for mid in &resp.supported {
            if supported.len() <= mid.index() {
                supported.resize(mid.index() + 1, false);
            }
            supported[mid.index()] = true;
        }
        debug!(
            mount_path,
            max_message_size = resp.max_message_size,
            supported = resp.supported.len(),
            "mounted"
        );

        let client = Client {
            socket: tokio::sync::Mutex::new(ClientSocket {
                comm,
                poisoned: false,
            }),
            pool: Mutex::new(ChannelPool::default()),
            supported,
            max_message_size: resp.max_message_size,
            max_channels: self.max_channels,
            closed: AtomicBool::new(false),
        };
        Ok((client, resp.root))
    }
}
