use burrow_core::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Message(#[from] burrow_core::Error),

    /// The peer answered with an error response.
    #[error("Remote error: {0}")]
    Remote(Errno),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection is shutting down")]
    Shutdown,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: u32 },

    #[error("Invalid handler table: {0}")]
    InvalidHandlers(String),

    #[error("Connection already started")]
    AlreadyStarted,

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Error code reported by the peer, if this is a per-request failure.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Remote(errno) => Some(*errno),
            _ => None,
        }
    }

    /// Orderly teardown: the peer hung up or we are shutting down.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Shutdown => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// The transport this error came from can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Shutdown | Self::InvalidFrame(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
