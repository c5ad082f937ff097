//! Burrow Fabric - connection core of the burrow file protocol
//!
//! A server accepts a Unix socket per client and wraps it in a
//! [`Connection`]. The first request on a connection must mount a path;
//! after that the client may open channels, each one a shared memory region
//! with its own service task, so requests run in parallel without crossing
//! the control socket.
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//!
//! use burrow_fabric::{Client, ConnectionManager, HandlerTable, Inode, Server, ServerImpl};
//! use burrow_fabric::{Connection, Errno};
//!
//! struct Fs {
//!     handlers: HandlerTable,
//! }
//!
//! impl ServerImpl for Fs {
//!     fn mount(&self, _: &Connection, _: Arc<Server>) -> Result<Inode, Errno> {
//!         Ok(Inode { control_fd: 1 })
//!     }
//!
//!     fn handlers(&self) -> &HandlerTable {
//!         &self.handlers
//!     }
//!
//!     fn server(&self) -> Option<Arc<Server>> {
//!         None
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (server_sock, client_sock) = UnixStream::pair()?;
//! let manager = ConnectionManager::new();
//! let fs = Arc::new(Fs { handlers: HandlerTable::with_builtins() });
//!
//! let conn = manager.create_connection(server_sock, fs)?;
//! manager.start_connection(&conn)?;
//!
//! let (client, root) = Client::connect(client_sock, "/").await?;
//! assert_eq!(root.control_fd, 1);
//!
//! client.close().await;
//! manager.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
mod exchange;
pub mod handlers;
pub mod manager;
pub mod messages;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use burrow_core::{Errno, Marshal, Mid};
pub use client::{Client, ClientBuilder};
pub use connection::Connection;
pub use error::{Error, Result};
pub use handlers::{request, respond, HandlerTable, RpcHandler};
pub use manager::{ConnectionManager, ManagerBuilder};
pub use messages::Inode;
pub use server::{Server, ServerImpl, DEFAULT_MAX_MESSAGE_SIZE};
pub use transport::{Communicator, MAX_DONATED_FDS};
