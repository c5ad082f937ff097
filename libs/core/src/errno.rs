use std::fmt;
use std::io;

/// Protocol error code carried in error responses.
///
/// Values are Linux error numbers so they can be handed back to a sandboxed
/// caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub u32);

impl Errno {
    pub const EIO: Errno = Errno(libc::EIO as u32);
    pub const EBADF: Errno = Errno(libc::EBADF as u32);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM as u32);
    pub const EBUSY: Errno = Errno(libc::EBUSY as u32);
    pub const EINVAL: Errno = Errno(libc::EINVAL as u32);
    pub const EMFILE: Errno = Errno(libc::EMFILE as u32);
    pub const EMSGSIZE: Errno = Errno(libc::EMSGSIZE as u32);
    pub const EOPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP as u32);
    pub const ENOBUFS: Errno = Errno(libc::ENOBUFS as u32);

    /// Raw error number.
    pub fn code(self) -> u32 {
        self.0
    }

    /// Maps an I/O error to its OS error number, falling back to `EIO`.
    pub fn from_io(err: &io::Error) -> Self {
        err.raw_os_error()
            .and_then(|code| u32::try_from(code).ok())
            .map(Errno)
            .unwrap_or(Errno::EIO)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match i32::try_from(self.0) {
            Ok(code) => write!(f, "{} (errno {})", io::Error::from_raw_os_error(code), self.0),
            Err(_) => write!(f, "errno {}", self.0),
        }
    }
}

impl std::error::Error for Errno {}
