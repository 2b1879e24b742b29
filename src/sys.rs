//! Thin wrappers over the Linux descriptor primitives the source variants are
//! built on: `timerfd`, `signalfd` and `eventfd`. Each wrapper owns its
//! descriptor and closes it on drop.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn read_u64(fd: RawFd) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(u64::from_ne_bytes(buf))
    }
}

/// Blocks `signum` for the calling thread (and, when called before any thread
/// is spawned, effectively for the process). A signal must be blocked before
/// a [`Signal`](crate::EventSource::signal) source can observe it; this is the
/// caller's responsibility, done once at startup.
pub fn block_signal(signum: i32) -> io::Result<()> {
    unsafe {
        let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
        cvt(libc::sigemptyset(mask.as_mut_ptr()))?;
        cvt(libc::sigaddset(mask.as_mut_ptr(), signum))?;
        let err = libc::pthread_sigmask(libc::SIG_BLOCK, mask.as_ptr(), std::ptr::null_mut());
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
    }
    Ok(())
}

/// Switches `O_NONBLOCK` on a descriptor the caller obtained elsewhere.
/// Descriptors added to a source must be non-blocking; sockets created
/// through `mio::net` already are.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
    Ok(())
}

/// Monotonic one-shot kernel timer.
pub(crate) struct TimerFd(OwnedFd);

impl TimerFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Arms the timer to expire once at an absolute deadline `interval_ms`
    /// from now. Re-arming from the current time on every call means the
    /// period is measured from each rearm, not from a fixed origin.
    pub(crate) fn arm_in(&self, interval_ms: u64) -> io::Result<()> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        cvt(unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) })?;
        let deadline =
            now.tv_sec as u64 * 1_000_000_000 + now.tv_nsec as u64 + interval_ms * 1_000_000;
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (deadline / 1_000_000_000) as libc::time_t,
                tv_nsec: (deadline % 1_000_000_000) as libc::c_long,
            },
        };
        cvt(unsafe {
            libc::timerfd_settime(
                self.0.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Drains the expiration counter. `WouldBlock` when the timer has not
    /// expired since the last read.
    pub(crate) fn read_expirations(&self) -> io::Result<u64> {
        read_u64(self.0.as_raw_fd())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Queued-signal descriptor armed for exactly one signal.
pub(crate) struct SignalFd(OwnedFd);

impl SignalFd {
    pub(crate) fn new(signum: i32) -> io::Result<Self> {
        let fd = unsafe {
            let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
            cvt(libc::sigemptyset(mask.as_mut_ptr()))?;
            cvt(libc::sigaddset(mask.as_mut_ptr(), signum))?;
            cvt(libc::signalfd(
                -1,
                mask.as_ptr(),
                libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
            ))?
        };
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Drains one queued signal record. `WouldBlock` when none is pending.
    pub(crate) fn read_one(&self) -> io::Result<u32> {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let n = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                info.as_mut_ptr().cast(),
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { info.assume_init() }.ssi_signo)
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Kernel counter used both by the idle source and as the loop's wakeup
/// primitive. `write` is a single `write(2)` call, so it is safe from other
/// threads and from signal-handler context.
pub(crate) struct EventFd(OwnedFd);

impl EventFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub(crate) fn write(&self, value: u64) -> io::Result<()> {
        let buf = value.to_ne_bytes();
        let n = unsafe { libc::write(self.0.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter is still a pending wakeup.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drains the counter. `WouldBlock` when it is zero.
    pub(crate) fn read(&self) -> io::Result<u64> {
        read_u64(self.0.as_raw_fd())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
