use std::fmt;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use burrow_core::{Errno, Mid};
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::channel::{ChannelDesc, ChannelSet, NewChannel};
use crate::error::{Error, Result};
use crate::handlers::respond;
use crate::manager::ConnectionManager;
use crate::messages::ErrorResp;
use crate::server::ServerImpl;
use crate::transport::{ChannelComm, Communicator, FrameTransport, SocketComm};

/// One client session.
///
/// Cheap to clone; every clone refers to the same session. Created by
/// [`ConnectionManager::create_connection`] and serviced once started.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    manager: ConnectionManager,
    server_impl: Arc<dyn ServerImpl>,
    mounted: AtomicBool,
    mount_path: OnceLock<String>,
    /// Control socket, until the connection is started.
    socket: Mutex<Option<UnixStream>>,
    channels: Mutex<ChannelSet>,
    max_channels: usize,
    /// Control socket loop plus one task per channel.
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        manager: ConnectionManager,
        socket: UnixStream,
        server_impl: Arc<dyn ServerImpl>,
        max_channels: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                manager,
                server_impl,
                mounted: AtomicBool::new(false),
                mount_path: OnceLock::new(),
                socket: Mutex::new(Some(socket)),
                channels: Mutex::new(ChannelSet::default()),
                max_channels,
                tasks: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn server_impl(&self) -> &Arc<dyn ServerImpl> {
        &self.inner.server_impl
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::Acquire) && self.inner.mount_path.get().is_some()
    }

    /// Cleaned mount path, once mounted.
    pub fn mount_path(&self) -> Option<&str> {
        self.inner.mount_path.get().map(String::as_str)
    }

    /// Identifiers this connection's handler table serves.
    pub fn supported_messages(&self) -> Vec<Mid> {
        self.inner.server_impl.handlers().supported()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Regions of every channel created so far, in creation order.
    pub fn channel_descs(&self) -> Vec<ChannelDesc> {
        self.inner.channels.lock().descs()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Asks every service task of this connection to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.channels.lock().shutdown_all();
    }

    /// Wins the right to mount. Exactly one caller ever gets `true` unless
    /// the winner abandons.
    pub(crate) fn claim_mount(&self) -> bool {
        self.inner
            .mounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn abandon_mount(&self) {
        self.inner.mounted.store(false, Ordering::Release);
    }

    pub(crate) fn finish_mount(&self, mount_path: String) {
        // Only the claim winner gets here, and only once.
        let _ = self.inner.mount_path.set(mount_path);
    }

    pub(crate) fn take_socket(&self) -> Option<UnixStream> {
        self.inner.socket.lock().take()
    }

    pub(crate) fn create_channel(
        &self,
        max_message_size: u32,
    ) -> std::result::Result<NewChannel, Errno> {
        if self.is_shutting_down() {
            return Err(Errno::EBUSY);
        }
        self.inner.channels.lock().create(
            max_message_size,
            self.inner.max_channels,
            &self.inner.shutdown,
        )
    }

    pub(crate) fn dup_channel_memory(&self) -> std::result::Result<OwnedFd, Errno> {
        self.inner.channels.lock().dup_memory()
    }

    /// Services `comm` on a tracked task until the channel or the
    /// connection shuts down.
    pub(crate) fn spawn_channel(&self, id: usize, mut comm: ChannelComm, token: CancellationToken) {
        let conn = self.clone();
        self.inner.tasks.spawn(async move {
            debug!(conn = conn.id(), channel = id, "channel service started");
            if let Err(err) = conn.service(&mut comm, &token).await {
                // Shutdown errors are expected while tearing down.
                if err.is_shutdown() {
                    debug!(conn = conn.id(), channel = id, "channel closed");
                } else {
                    warn!(conn = conn.id(), channel = id, error = %err, "channel service failed");
                }
            }
            comm.shutdown();
            drop(comm);
            conn.release_channel(id);
        });
    }

    /// Frees the slot and region of channel `id` once nothing uses them.
    pub(crate) fn release_channel(&self, id: usize) {
        if self.inner.channels.lock().release(id) {
            debug!(conn = self.id(), channel = id, "channel released");
        }
    }

    /// Control socket loop. Returns once the connection has finished: the
    /// socket is closed and every channel task has exited.
    pub(crate) async fn serve(self, mut comm: SocketComm) {
        debug!(conn = self.id(), "connection started");
        let token = self.inner.shutdown.clone();
        if let Err(err) = self.service(&mut comm, &token).await {
            if err.is_shutdown() {
                debug!(conn = self.id(), "control socket closed");
            } else {
                warn!(conn = self.id(), error = %err, "control socket failed");
            }
        }
        comm.shutdown();

        self.shutdown();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!(
            conn = self.id(),
            channels = self.channel_count(),
            "connection finished"
        );
    }

    /// Reads requests from `comm` and answers them until a transport error
    /// or cancellation.
    async fn service<T: FrameTransport>(
        &self,
        comm: &mut T,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let (mid, payload_len) = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Shutdown),
                frame = comm.recv_frame() => frame?,
            };
            let (resp_mid, resp_len) = run_handler(|| self.handle_msg(comm, mid, payload_len));
            match comm.send_frame(resp_mid, resp_len).await {
                // Nothing was sent; fail only this request.
                Err(Error::MessageTooLarge { size, max }) => {
                    warn!(conn = self.id(), %mid, size, max, "response exceeds the maximum message size");
                    let resp_len = error_response(comm, Errno::EMSGSIZE);
                    comm.send_frame(Mid::ERROR, resp_len).await?;
                }
                sent => sent?,
            }
        }
    }

    /// Runs the handler for `mid` and returns the response frame's
    /// identifier and payload length.
    pub(crate) fn handle_msg(
        &self,
        comm: &mut dyn Communicator,
        mid: Mid,
        payload_len: u32,
    ) -> (Mid, u32) {
        let result = match self.inner.server_impl.handlers().get(mid) {
            Some(handler) => handler(self, comm, payload_len),
            None => {
                debug!(conn = self.id(), %mid, "unsupported message");
                Err(Errno::EOPNOTSUPP)
            }
        };

        let max = self.inner.server_impl.max_message_size();
        match result {
            Ok(resp_len) if resp_len > max => {
                warn!(conn = self.id(), %mid, resp_len, max, "response exceeds the maximum message size");
                (Mid::ERROR, error_response(comm, Errno::EMSGSIZE))
            }
            Ok(resp_len) => (mid, resp_len),
            Err(errno) => (Mid::ERROR, error_response(comm, errno)),
        }
    }
}

/// Runs a handler where it may block. On a multi-threaded runtime the worker
/// hands its other tasks off first, so a slow handler only holds up its own
/// transport.
fn run_handler<R>(handler: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(handler)
        }
        _ => handler(),
    }
}

/// Replaces the current response with an error response. Error responses
/// never carry descriptors.
fn error_response(comm: &mut dyn Communicator, errno: Errno) -> u32 {
    comm.clear_donations();
    respond(comm, &ErrorResp { errno }).unwrap_or(0)
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("mounted", &self.is_mounted())
            .field("mount_path", &self.mount_path())
            .field("channels", &self.channel_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use burrow_core::Marshal;

    use super::*;
    use crate::handlers::HandlerTable;
    use crate::messages::{ChannelResp, Inode, MountReq, MountResp};
    use crate::server::Server;

    #[derive(Default)]
    struct VecComm {
        buf: Vec<u8>,
        donated: Vec<OwnedFd>,
        refuse_donations: bool,
    }

    impl Communicator for VecComm {
        fn payload_buf(&mut self, size: u32) -> &mut [u8] {
            self.buf.resize(size as usize, 0);
            &mut self.buf
        }

        fn add_donation_fd(&mut self, fd: OwnedFd) -> std::result::Result<(), Errno> {
            if self.refuse_donations {
                return Err(Errno::EMFILE);
            }
            self.donated.push(fd);
            Ok(())
        }

        fn take_received_fds(&mut self) -> Vec<OwnedFd> {
            Vec::new()
        }

        fn clear_donations(&mut self) {
            self.donated.clear();
        }
    }

    struct TestFs {
        handlers: HandlerTable,
        refuse_mount: AtomicBool,
        mounts: AtomicUsize,
    }

    impl TestFs {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handlers: HandlerTable::with_builtins(),
                refuse_mount: AtomicBool::new(false),
                mounts: AtomicUsize::new(0),
            })
        }
    }

    impl ServerImpl for TestFs {
        fn mount(&self, _: &Connection, _: Arc<Server>) -> std::result::Result<Inode, Errno> {
            if self.refuse_mount.load(Ordering::SeqCst) {
                return Err(Errno::EIO);
            }
            self.mounts.fetch_add(1, Ordering::SeqCst);
            Ok(Inode { control_fd: 7 })
        }

        fn handlers(&self) -> &HandlerTable {
            &self.handlers
        }

        fn server(&self) -> Option<Arc<Server>> {
            None
        }
    }

    fn connection(fs: Arc<TestFs>) -> Connection {
        connection_with_channels(fs, 4)
    }

    fn connection_with_channels(fs: Arc<TestFs>, max_channels: usize) -> Connection {
        let (sock, _peer) = UnixStream::pair().unwrap();
        Connection::new(
            1,
            ConnectionManager::new(),
            sock,
            fs,
            max_channels,
            CancellationToken::new(),
        )
    }

    fn mount(conn: &Connection, path: &str) -> (Mid, Vec<u8>) {
        let mut comm = VecComm::default();
        let req = MountReq {
            mount_path: path.to_string(),
        };
        let len = req.size_bytes() as u32;
        req.marshal_bytes(comm.payload_buf(len)).unwrap();
        let (mid, resp_len) = conn.handle_msg(&mut comm, Mid::MOUNT, len);
        (mid, comm.payload_buf(resp_len).to_vec())
    }

    fn errno_of(payload: &[u8]) -> Errno {
        ErrorResp::unmarshal_bytes(payload).unwrap().errno
    }

    #[test]
    fn mount_cleans_the_path_and_reports_the_table() {
        let fs = TestFs::new();
        let conn = connection(fs.clone());

        let (mid, payload) = mount(&conn, "/srv//data/./x/..");
        assert_eq!(mid, Mid::MOUNT);
        let resp = MountResp::unmarshal_bytes(&payload).unwrap();
        assert_eq!(resp.root, Inode { control_fd: 7 });
        assert_eq!(resp.supported, vec![Mid::MOUNT, Mid::CHANNEL]);
        assert!(conn.is_mounted());
        assert_eq!(conn.mount_path(), Some("/srv/data"));
        assert_eq!(conn.manager().get_server("/srv/data").mount_count(), 1);
    }

    #[test]
    fn relative_mount_path_is_rejected() {
        let conn = connection(TestFs::new());

        let (mid, payload) = mount(&conn, "srv/data");
        assert_eq!(mid, Mid::ERROR);
        assert_eq!(errno_of(&payload), Errno::EINVAL);
        assert!(!conn.is_mounted());

        // The failed attempt does not use up the mount.
        assert_eq!(mount(&conn, "/srv").0, Mid::MOUNT);
    }

    #[test]
    fn second_mount_is_busy() {
        let conn = connection(TestFs::new());
        assert_eq!(mount(&conn, "/a").0, Mid::MOUNT);

        let (mid, payload) = mount(&conn, "/b");
        assert_eq!(mid, Mid::ERROR);
        assert_eq!(errno_of(&payload), Errno::EBUSY);
        assert_eq!(conn.mount_path(), Some("/a"));
    }

    #[test]
    fn refused_mount_can_be_retried() {
        let fs = TestFs::new();
        fs.refuse_mount.store(true, Ordering::SeqCst);
        let conn = connection(fs.clone());

        let (mid, payload) = mount(&conn, "/a");
        assert_eq!(mid, Mid::ERROR);
        assert_eq!(errno_of(&payload), Errno::EIO);
        assert!(!conn.is_mounted());

        fs.refuse_mount.store(false, Ordering::SeqCst);
        assert_eq!(mount(&conn, "/a").0, Mid::MOUNT);
        assert!(conn.is_mounted());
    }

    #[test]
    fn unsupported_message_gets_eopnotsupp() {
        let conn = connection(TestFs::new());
        for mid in [Mid::ERROR, Mid(2000), Mid::NONE] {
            let mut comm = VecComm::default();
            let (resp_mid, len) = conn.handle_msg(&mut comm, mid, 0);
            assert_eq!(resp_mid, Mid::ERROR);
            assert_eq!(errno_of(comm.payload_buf(len)), Errno::EOPNOTSUPP);
        }
        assert!(!conn.is_mounted());
    }

    #[test]
    fn garbage_mount_request_is_invalid() {
        let conn = connection(TestFs::new());
        let mut comm = VecComm::default();
        comm.payload_buf(2).copy_from_slice(&[0xff, 0xff]);
        let (mid, len) = conn.handle_msg(&mut comm, Mid::MOUNT, 2);
        assert_eq!(mid, Mid::ERROR);
        assert_eq!(errno_of(comm.payload_buf(len)), Errno::EINVAL);
    }

    #[test]
    fn concurrent_mounts_have_one_winner() {
        let fs = TestFs::new();
        let conn = connection(fs.clone());

        let winners: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let conn = &conn;
                    s.spawn(move || mount(conn, &format!("/m{i}")).0 == Mid::MOUNT)
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(fs.mounts.load(Ordering::SeqCst), 1);
        assert!(conn.is_mounted());
    }

    #[tokio::test]
    async fn failed_channel_setup_gives_the_slot_back() {
        let conn = connection_with_channels(TestFs::new(), 1);

        let mut refusing = VecComm {
            refuse_donations: true,
            ..VecComm::default()
        };
        let (mid, len) = conn.handle_msg(&mut refusing, Mid::CHANNEL, 0);
        assert_eq!(mid, Mid::ERROR);
        assert_eq!(errno_of(refusing.payload_buf(len)), Errno::EMFILE);
        assert!(refusing.donated.is_empty());
        assert_eq!(conn.channel_count(), 0);

        // The only slot is free again.
        let mut comm = VecComm::default();
        let (mid, len) = conn.handle_msg(&mut comm, Mid::CHANNEL, 0);
        assert_eq!(mid, Mid::CHANNEL);
        let resp = ChannelResp::unmarshal_bytes(comm.payload_buf(len)).unwrap();
        assert_eq!(comm.donated.len(), 2);
        assert_eq!(conn.channel_count(), 1);
        assert_eq!(conn.channel_descs()[0].offset, resp.data_offset);

        conn.shutdown();
    }

    #[tokio::test]
    async fn closed_channel_is_released() {
        let conn = connection_with_channels(TestFs::new(), 1);
        let mut comm = VecComm::default();
        assert_eq!(conn.handle_msg(&mut comm, Mid::CHANNEL, 0).0, Mid::CHANNEL);
        assert_eq!(conn.channel_count(), 1);

        // Hanging up the client doorbell ends the channel task.
        drop(comm);
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while conn.channel_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut comm = VecComm::default();
        assert_eq!(conn.handle_msg(&mut comm, Mid::CHANNEL, 0).0, Mid::CHANNEL);
        conn.shutdown();
    }

    #[test]
    fn channels_are_refused_while_shutting_down() {
        let conn = connection(TestFs::new());
        conn.shutdown();
        assert!(conn.is_shutting_down());
        assert_eq!(conn.create_channel(64).err(), Some(Errno::EBUSY));
        assert_eq!(conn.channel_count(), 0);
    }
}
