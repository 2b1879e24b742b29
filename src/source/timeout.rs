use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::event::Ready;
use crate::source::SourceFd;
use crate::sys::TimerFd;

/// Periodic timer state: one timer descriptor plus the interval it is
/// re-armed with after every dispatch.
pub(crate) struct Timeout {
    timer: TimerFd,
    interval_ms: u64,
}

impl Timeout {
    pub(crate) fn new(interval_ms: u64) -> io::Result<Self> {
        Ok(Self {
            timer: TimerFd::new()?,
            interval_ms,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }

    /// Schedules the next deadline at `now + interval`. Called once on
    /// attach and again after every dispatch that keeps the source armed,
    /// so the period is measured from each rearm rather than a fixed
    /// origin.
    pub(crate) fn rearm(&self) -> io::Result<()> {
        self.timer.arm_in(self.interval_ms)
    }

    /// Drains the expiration count; fires at most once per check even when
    /// the kernel coalesced several expirations. A would-block read means
    /// a spurious wake: the read flag is cleared and the source is not
    /// ready.
    pub(crate) fn check(&self, fd: &SourceFd) -> bool {
        if !fd.ready().is_readable() {
            return false;
        }
        match self.timer.read_expirations() {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fd.clear_ready(Ready::READABLE);
                false
            }
            Err(_) => false,
        }
    }
}
