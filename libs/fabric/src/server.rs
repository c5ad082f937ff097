use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burrow_core::Errno;

use crate::connection::Connection;
use crate::handlers::HandlerTable;
use crate::messages::Inode;

/// Default bound on a single payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1 << 20;

/// Filesystem-specific side of a connection.
///
/// The connection core calls exactly these methods and nothing else; what
/// the handlers do with the filesystem is up to the implementation.
pub trait ServerImpl: Send + Sync + 'static {
    /// Produces the root handle for a connection mounting `server`.
    fn mount(&self, conn: &Connection, server: Arc<Server>) -> Result<Inode, Errno>;

    /// Handler table; read-only for the life of every connection using it.
    fn handlers(&self) -> &HandlerTable;

    /// The server object handed to the last successful mount, if any.
    fn server(&self) -> Option<Arc<Server>>;

    /// Largest payload accepted or produced by this implementation.
    fn max_message_size(&self) -> u32 {
        DEFAULT_MAX_MESSAGE_SIZE
    }
}

/// State shared by every connection mounting the same path.
#[derive(Debug)]
pub struct Server {
    mount_path: String,
    mounts: AtomicUsize,
}

impl Server {
    pub(crate) fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            mounts: AtomicUsize::new(0),
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Successful mounts of this path so far.
    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_mount(&self) {
        self.mounts.fetch_add(1, Ordering::Relaxed);
    }
}
