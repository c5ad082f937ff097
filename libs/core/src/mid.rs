use std::fmt;

/// Message identifier.
///
/// Selects the handler a frame is dispatched to and doubles as the index
/// into the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mid(pub u16);

impl Mid {
    /// Error response. Never has a handler, so clients can never invoke it.
    pub const ERROR: Mid = Mid(0);
    /// Mount handshake.
    pub const MOUNT: Mid = Mid(1);
    /// Shared-memory channel creation.
    pub const CHANNEL: Mid = Mid(2);
    /// Reserved "no such message"; no handler may ever live here.
    pub const NONE: Mid = Mid(u16::MAX);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// The next identifier, handy for numbering messages after the builtins.
    /// `None` past the last representable value.
    pub const fn next(self) -> Option<Mid> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Mid(raw)),
            None => None,
        }
    }
}

impl From<u16> for Mid {
    fn from(raw: u16) -> Self {
        Mid(raw)
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mid::ERROR => f.write_str("Error"),
            Mid::MOUNT => f.write_str("Mount"),
            Mid::CHANNEL => f.write_str("Channel"),
            Mid::NONE => f.write_str("None"),
            Mid(raw) => write!(f, "Mid({raw})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_follows_the_builtins() {
        assert_eq!(Mid::MOUNT.next(), Some(Mid::CHANNEL));
        assert_eq!(Mid::CHANNEL.next(), Some(Mid(3)));
    }

    #[test]
    fn next_stops_at_the_last_identifier() {
        assert_eq!(Mid(u16::MAX - 1).next(), Some(Mid::NONE));
        assert_eq!(Mid::NONE.next(), None);
    }
}
