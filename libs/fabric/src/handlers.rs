use std::fmt;
use std::os::fd::OwnedFd;

use burrow_core::{Errno, Marshal, Mid};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::messages::{ChannelResp, MountReq, MountResp};
use crate::transport::Communicator;

/// Handles one request.
///
/// The request payload is `comm.payload_buf(payload_len)`. The handler
/// writes its response into `comm.payload_buf(n)`, donates any descriptors
/// through `comm`, and returns `n`. An error is sent back as an error
/// response instead.
///
/// Handlers run on the service task of the transport the request came in
/// on, so a slow handler only holds up that transport.
pub type RpcHandler =
    fn(conn: &Connection, comm: &mut dyn Communicator, payload_len: u32) -> std::result::Result<u32, Errno>;

/// Mapping from message identifier to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Vec<Option<RpcHandler>>,
}

impl HandlerTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the mount and channel handlers registered.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(Mid::MOUNT, mount_handler)
            .register(Mid::CHANNEL, channel_handler)
    }

    pub fn register(mut self, mid: Mid, handler: RpcHandler) -> Self {
        if self.handlers.len() <= mid.index() {
            self.handlers.resize(mid.index() + 1, None);
        }
        self.handlers[mid.index()] = Some(handler);
        self
    }

    pub fn get(&self, mid: Mid) -> Option<RpcHandler> {
        self.handlers.get(mid.index()).copied().flatten()
    }

    /// Identifiers with a handler, in ascending order.
    pub fn supported(&self) -> Vec<Mid> {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_some())
            .filter_map(|(i, _)| u16::try_from(i).ok().map(Mid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supported().is_empty()
    }

    /// Rejects tables that could collide with the reserved identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidHandlers("no handlers registered".into()));
        }
        if self.get(Mid::ERROR).is_some() {
            return Err(Error::InvalidHandlers(
                "error responses cannot have a handler".into(),
            ));
        }
        if self.handlers.len() > Mid::NONE.index() {
            return Err(Error::InvalidHandlers(format!(
                "table of {} entries reaches the reserved identifier {}",
                self.handlers.len(),
                Mid::NONE.0
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("supported", &self.supported())
            .finish()
    }
}

/// Decodes the current request payload.
pub fn request<M: Marshal>(
    comm: &mut dyn Communicator,
    payload_len: u32,
) -> std::result::Result<M, Errno> {
    M::unmarshal_bytes(comm.payload_buf(payload_len)).map_err(|err| {
        debug!(error = %err, "malformed request");
        Errno::EINVAL
    })
}

/// Encodes `resp` as the response payload and returns its length.
pub fn respond<M: Marshal>(
    comm: &mut dyn Communicator,
    resp: &M,
) -> std::result::Result<u32, Errno> {
    let len = u32::try_from(resp.size_bytes()).map_err(|_| Errno::EMSGSIZE)?;
    let buf = comm.payload_buf(len);
    if buf.len() < len as usize {
        return Err(Errno::EMSGSIZE);
    }
    resp.marshal_bytes(buf).map_err(|err| {
        warn!(error = %err, "failed to encode response");
        Errno::EIO
    })?;
    Ok(len)
}

/// Lexically normalizes a slash-separated path: collapses repeated
/// separators, drops `.` and resolves `..` against earlier elements.
pub(crate) fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Handles [`Mid::MOUNT`].
pub fn mount_handler(
    c: &Connection,
    comm: &mut dyn Communicator,
    payload_len: u32,
) -> std::result::Result<u32, Errno> {
    let req: MountReq = request(comm, payload_len)?;

    let mount_path = clean_path(&req.mount_path);
    if !mount_path.starts_with('/') {
        warn!(conn = c.id(), path = %mount_path, "mount path is not absolute");
        return Err(Errno::EINVAL);
    }

    if !c.claim_mount() {
        warn!(conn = c.id(), path = %mount_path, "connection has already been mounted");
        return Err(Errno::EBUSY);
    }

    let server = c.manager().get_server(&mount_path);
    let root = match c.server_impl().mount(c, server.clone()) {
        Ok(root) => root,
        Err(errno) => {
            c.abandon_mount();
            return Err(errno);
        }
    };
    server.record_mount();
    c.finish_mount(mount_path);
    info!(conn = c.id(), path = ?c.mount_path(), "mounted");

    let resp = MountResp {
        root,
        max_message_size: c.server_impl().max_message_size(),
        supported: c.supported_messages(),
    };
    respond(comm, &resp)
}

/// Handles [`Mid::CHANNEL`].
pub fn channel_handler(
    c: &Connection,
    comm: &mut dyn Communicator,
    _payload_len: u32,
) -> std::result::Result<u32, Errno> {
    let channel = c.create_channel(c.server_impl().max_message_size())?;
    let id = channel.id;
    let desc = channel.desc;
    let client_doorbell = channel.client_doorbell;

    // Service the channel for the rest of the connection's life.
    c.spawn_channel(id, channel.comm, channel.shutdown);

    if let Err(errno) = donate_channel_fds(c, comm, client_doorbell) {
        // The client never sees the region, so it is free again at once.
        warn!(conn = c.id(), channel = id, %errno, "failed to donate channel descriptors");
        c.release_channel(id);
        return Err(errno);
    }

    respond(
        comm,
        &ChannelResp {
            data_offset: desc.offset,
            data_length: desc.length,
        },
    )
}

fn donate_channel_fds(
    c: &Connection,
    comm: &mut dyn Communicator,
    client_doorbell: OwnedFd,
) -> std::result::Result<(), Errno> {
    let data_fd = c.dup_channel_memory()?;
    comm.add_donation_fd(data_fd)?;
    comm.add_donation_fd(client_doorbell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Connection, _: &mut dyn Communicator, _: u32) -> std::result::Result<u32, Errno> {
        Ok(0)
    }

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("//a//b/"), "/a/b");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("./"), ".");
    }

    #[test]
    fn builtins_are_supported() {
        let table = HandlerTable::with_builtins();
        assert_eq!(table.supported(), vec![Mid::MOUNT, Mid::CHANNEL]);
        assert!(table.get(Mid::ERROR).is_none());
        assert!(table.get(Mid(1000)).is_none());
        table.validate().unwrap();
    }

    #[test]
    fn error_slot_cannot_be_registered() {
        let table = HandlerTable::with_builtins().register(Mid::ERROR, noop);
        assert!(matches!(table.validate(), Err(Error::InvalidHandlers(_))));
    }

    #[test]
    fn reserved_identifier_cannot_be_registered() {
        let table = HandlerTable::new().register(Mid::NONE, noop);
        assert!(matches!(table.validate(), Err(Error::InvalidHandlers(_))));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(HandlerTable::new().validate().is_err());
    }
}
