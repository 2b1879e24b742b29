use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::event::Ready;
use crate::source::SourceFd;
use crate::sys::SignalFd;

/// Signal source state: a descriptor armed for exactly one OS signal. The
/// signal must already be blocked (see [`sys::block_signal`](crate::sys::block_signal))
/// or it will never reach the descriptor.
pub(crate) struct Signal {
    sfd: SignalFd,
}

impl Signal {
    pub(crate) fn new(signum: i32) -> io::Result<Self> {
        Ok(Self {
            sfd: SignalFd::new(signum)?,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.sfd.as_raw_fd()
    }

    /// Drains one queued signal record; ready only when one was present.
    pub(crate) fn check(&self, fd: &SourceFd) -> bool {
        if !fd.ready().is_readable() {
            return false;
        }
        match self.sfd.read_one() {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fd.clear_ready(Ready::READABLE);
                false
            }
            Err(_) => false,
        }
    }
}
