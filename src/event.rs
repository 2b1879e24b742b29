use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use mio::Interest;

/// Readiness flags carried by a [`SourceFd`](crate::SourceFd), abstracting the
/// raw epoll event bits behind a small platform-neutral mask.
///
/// `READABLE` and `WRITABLE` may be requested as interest; `ERROR` and
/// `HANGUP` are only ever observed. All registrations are edge-triggered: a
/// flag is reported once per state transition, and a callback that exhausts a
/// condition (e.g. reads until `WouldBlock`) is expected to clear the
/// corresponding flag with [`SourceFd::clear_ready`](crate::SourceFd::clear_ready)
/// until the kernel re-arms it.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HANGUP: Ready = Ready(0b1000);
    pub const ALL: Ready = Ready(0b1111);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    pub fn is_hangup(self) -> bool {
        self.contains(Ready::HANGUP)
    }

    /// True when every flag in `other` is set in `self`.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one flag is set in both masks.
    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `self` with every flag in `other` cleared.
    #[must_use]
    pub fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }

    /// Translates the requestable part of the mask for kernel registration.
    /// `None` when neither read nor write interest is present.
    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        let mut sep = "";
        for (flag, name) in [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HANGUP, "HANGUP"),
        ] {
            if self.contains(flag) {
                write!(f, "{}{}", sep, name)?;
                sep = " | ";
            }
        }
        Ok(())
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        if event.is_read_closed() && event.is_write_closed() {
            ready |= Ready::HANGUP;
        }
        ready
    }
}
