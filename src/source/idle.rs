use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::event::Ready;
use crate::source::SourceFd;
use crate::sys::EventFd;

/// Idle source state: an eventfd the source signals itself through. After
/// every dispatch `prepare` bumps the counter again, so the source is ready
/// on every pass; its pinned minimum priority defers it behind all real work
/// in the same batch.
pub(crate) struct Idle {
    efd: EventFd,
}

impl Idle {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            efd: EventFd::new()?,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.efd.as_raw_fd()
    }

    pub(crate) fn signal(&self) {
        if let Err(e) = self.efd.write(1) {
            log::warn!("idle source failed to re-signal itself: {}", e);
        }
    }

    pub(crate) fn check(&self, fd: &SourceFd) -> bool {
        if !fd.ready().is_readable() {
            return false;
        }
        match self.efd.read() {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fd.clear_ready(Ready::READABLE);
                false
            }
            Err(_) => false,
        }
    }
}
