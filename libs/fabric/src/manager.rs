use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::server::{Server, ServerImpl};
use crate::transport::{FdStream, SocketComm};

/// Default per-connection channel limit.
pub const DEFAULT_MAX_CHANNELS: usize = 64;

/// Registry of live connections.
///
/// Cheap to clone; clones share the registry. [`wait`](Self::wait) returns
/// once every started connection has finished.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    max_channels: usize,
    connections: TaskTracker,
    shutdown: CancellationToken,
    servers: Mutex<HashMap<String, Arc<Server>>>,
    next_id: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the manager
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Wraps `socket` in a new connection without starting it.
    ///
    /// Fails if the handler table of `server_impl` is unusable.
    pub fn create_connection(
        &self,
        socket: UnixStream,
        server_impl: Arc<dyn ServerImpl>,
    ) -> Result<Connection> {
        server_impl.handlers().validate()?;
        if server_impl.max_message_size() == 0 {
            return Err(Error::custom("maximum message size must be positive"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Connection::new(
            id,
            self.clone(),
            socket,
            server_impl,
            self.inner.max_channels,
            self.inner.shutdown.child_token(),
        ))
    }

    /// Spawns the connection's control socket loop. Must be called from
    /// within a Tokio runtime.
    pub fn start_connection(&self, conn: &Connection) -> Result<()> {
        let socket = conn.take_socket().ok_or(Error::AlreadyStarted)?;
        let stream = FdStream::from_std(socket)?;
        let comm = SocketComm::new(stream, conn.server_impl().max_message_size());
        debug!(conn = conn.id(), "starting connection");
        self.inner.connections.spawn(conn.clone().serve(comm));
        Ok(())
    }

    /// Waits until every started connection has finished.
    pub async fn wait(&self) {
        self.inner.connections.close();
        self.inner.connections.wait().await;
    }

    /// Shuts down every connection, started or not.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Started connections that have not finished yet.
    pub fn live_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// The server object for `mount_path`, created on first use.
    pub fn get_server(&self, mount_path: &str) -> Arc<Server> {
        self.inner
            .servers
            .lock()
            .entry(mount_path.to_string())
            .or_insert_with(|| Arc::new(Server::new(mount_path)))
            .clone()
    }
}

/// Builder for configuring a [`ConnectionManager`]
pub struct ManagerBuilder {
    max_channels: usize,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
        }
    }
}

impl ManagerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many channels a single connection may create
    pub fn max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn build(self) -> ConnectionManager {
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                max_channels: self.max_channels,
                connections: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                servers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}
