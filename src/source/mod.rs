//! Event sources: polymorphic readiness producers unified behind one
//! dispatch protocol.
//!
//! Every source answers the same four hooks the loop drives it with:
//! `prepare` (re-arm after a dispatch that kept the source alive), `check`
//! (confirm and consume genuine readiness), `dispatch` (run the user
//! callback) and finalization on drop. The variant set is closed — generic
//! descriptor sets, periodic timers, OS signals, idle work and the loop's
//! internal wakeup — so the variants live in one enum rather than an open
//! trait hierarchy.

mod fd;
mod idle;
mod signal;
mod timeout;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

pub use fd::SourceFd;

use crate::error::{Error, Result};
use crate::event::Ready;
use crate::reactor::LoopInner;
use crate::sys::EventFd;
use idle::Idle;
use signal::Signal;
use timeout::Timeout;

pub(crate) enum SourceKind {
    /// Generic descriptor set populated by the caller.
    Fds,
    Timeout(Timeout),
    Signal(Signal),
    Idle(Idle),
    /// The loop's internal quit source, draining the wakeup eventfd shared
    /// with [`Waker`](crate::Waker) handles.
    Wakeup(Arc<EventFd>),
}

pub(crate) enum Callback {
    /// For `Fds` sources: receives the specific ready descriptor.
    Fd(Box<dyn FnMut(&SourceFd) -> bool>),
    /// For timer/signal/idle/wakeup sources.
    Simple(Box<dyn FnMut() -> bool>),
}

/// A readiness producer registered with an [`EventLoop`](crate::EventLoop).
///
/// Handles are cheap clones sharing one underlying source; identity is
/// pointer identity. A source is created detached, attached with
/// [`EventLoop::add_source`](crate::EventLoop::add_source) and detached with
/// `del_source` or loop teardown. Its user callback returns `true` to keep
/// the source armed or `false` to have the loop remove it.
#[derive(Clone)]
pub struct EventSource {
    pub(crate) inner: Rc<SourceInner>,
}

pub(crate) struct SourceInner {
    priority: Cell<i32>,
    kind: SourceKind,
    callback: RefCell<Callback>,
    fds: RefCell<Vec<SourceFd>>,
    owner: RefCell<Weak<LoopInner>>,
}

impl EventSource {
    fn with_kind(kind: SourceKind, callback: Callback, priority: i32) -> Self {
        Self {
            inner: Rc::new(SourceInner {
                priority: Cell::new(priority),
                kind,
                callback: RefCell::new(callback),
                fds: RefCell::new(Vec::new()),
                owner: RefCell::new(Weak::new()),
            }),
        }
    }

    /// Creates a generic descriptor-set source. The set starts empty; the
    /// caller populates it with [`add_fd`](Self::add_fd). The callback runs
    /// once per confirmed-ready descriptor and receives that descriptor.
    pub fn fds<F>(callback: F) -> Self
    where
        F: FnMut(&SourceFd) -> bool + 'static,
    {
        Self::with_kind(SourceKind::Fds, Callback::Fd(Box::new(callback)), 0)
    }

    /// Creates a periodic timer source firing once per `interval_ms`
    /// milliseconds. Each deadline is scheduled relative to the previous
    /// rearm, so intervals do not drift toward a fixed origin. Returning
    /// `false` from the callback permanently stops the timer.
    pub fn timeout<F>(interval_ms: u64, callback: F) -> Result<Self>
    where
        F: FnMut() -> bool + 'static,
    {
        let state = Timeout::new(interval_ms)?;
        let raw = state.raw_fd();
        let source = Self::with_kind(
            SourceKind::Timeout(state),
            Callback::Simple(Box::new(callback)),
            0,
        );
        source.add_fd(raw, Ready::READABLE)?;
        Ok(source)
    }

    /// Creates a source dispatching once per delivery of `signum`. The
    /// signal must be blocked process-wide before the loop first waits; see
    /// [`sys::block_signal`](crate::sys::block_signal).
    pub fn signal<F>(signum: i32, callback: F) -> Result<Self>
    where
        F: FnMut() -> bool + 'static,
    {
        let state = Signal::new(signum)?;
        let raw = state.raw_fd();
        let source = Self::with_kind(
            SourceKind::Signal(state),
            Callback::Simple(Box::new(callback)),
            0,
        );
        source.add_fd(raw, Ready::READABLE)?;
        Ok(source)
    }

    /// Creates an always-ready source pinned to the minimum priority, so it
    /// only runs when nothing else in the batch is pending.
    pub fn idle<F>(callback: F) -> Result<Self>
    where
        F: FnMut() -> bool + 'static,
    {
        let state = Idle::new()?;
        let raw = state.raw_fd();
        let source = Self::with_kind(
            SourceKind::Idle(state),
            Callback::Simple(Box::new(callback)),
            i32::MIN,
        );
        source.add_fd(raw, Ready::READABLE)?;
        Ok(source)
    }

    pub(crate) fn wakeup<F>(efd: Arc<EventFd>, callback: F) -> Result<Self>
    where
        F: FnMut() -> bool + 'static,
    {
        let raw = efd.as_raw_fd();
        let source = Self::with_kind(
            SourceKind::Wakeup(efd),
            Callback::Simple(Box::new(callback)),
            i32::MAX,
        );
        source.add_fd(raw, Ready::READABLE)?;
        Ok(source)
    }

    /// Larger priorities are serviced first within a batch; default 0.
    pub fn priority(&self) -> i32 {
        self.inner.priority.get()
    }

    pub fn set_priority(&self, priority: i32) {
        self.inner.priority.set(priority);
    }

    /// Adds a raw descriptor to the source's set. The interest mask must
    /// include read or write readiness. If the source is attached to a loop
    /// the descriptor is registered with the kernel immediately
    /// (edge-triggered); otherwise registration happens on attach.
    ///
    /// The source never takes ownership of the descriptor: the caller keeps
    /// it open for as long as it is in the set and closes it afterwards.
    pub fn add_fd(&self, fd: RawFd, interest: Ready) -> Result<SourceFd> {
        if interest.to_interest().is_none() {
            return Err(Error::InvalidInterest);
        }
        let sfd = SourceFd::new(&self.inner, fd, interest);
        self.inner.fds.borrow_mut().push(sfd.clone());
        if let Some(owner) = self.owner() {
            if let Err(e) = owner.register_fd(&sfd) {
                sfd.detach();
                self.inner.fds.borrow_mut().pop();
                return Err(e);
            }
        }
        Ok(sfd)
    }

    /// Removes the descriptor numbered `fd` from the set, deregistering it
    /// from the kernel instance if attached. Returns `false` when no such
    /// descriptor is in the set.
    pub fn del_fd(&self, fd: RawFd) -> bool {
        let pos = self
            .inner
            .fds
            .borrow()
            .iter()
            .position(|sfd| sfd.raw_fd() == fd);
        let Some(pos) = pos else {
            return false;
        };
        let sfd = self.inner.fds.borrow_mut().remove(pos);
        if let Some(owner) = self.owner() {
            if let Err(e) = owner.deregister_fd(&sfd) {
                log::warn!("failed to deregister fd {}: {}", sfd.raw_fd(), e);
            }
        }
        sfd.detach();
        true
    }

    pub(crate) fn fds_snapshot(&self) -> Vec<SourceFd> {
        self.inner.fds.borrow().clone()
    }

    pub(crate) fn owner(&self) -> Option<Rc<LoopInner>> {
        self.inner.owner.borrow().upgrade()
    }

    pub(crate) fn set_owner(&self, owner: Weak<LoopInner>) {
        *self.inner.owner.borrow_mut() = owner;
    }

    pub(crate) fn clear_owner(&self) {
        *self.inner.owner.borrow_mut() = Weak::new();
    }

    pub(crate) fn attached_to(&self, loop_inner: &Rc<LoopInner>) -> bool {
        self.owner()
            .map_or(false, |owner| Rc::ptr_eq(&owner, loop_inner))
    }

    /// Re-arms variant state after a dispatch that kept the source alive
    /// (and once on attach). No-op for variants with nothing to re-arm.
    pub(crate) fn prepare(&self) {
        match &self.inner.kind {
            SourceKind::Timeout(t) => {
                if let Err(e) = t.rearm() {
                    log::warn!("failed to re-arm timer source: {}", e);
                }
            }
            SourceKind::Idle(i) => i.signal(),
            SourceKind::Fds | SourceKind::Signal(_) | SourceKind::Wakeup(_) => {}
        }
    }

    /// Confirms (and for self-consuming variants, drains) readiness on
    /// `fd`. A `false` result means the wake was spurious or already
    /// exhausted; the loop will not dispatch.
    pub(crate) fn check(&self, fd: &SourceFd) -> bool {
        match &self.inner.kind {
            SourceKind::Fds => !fd.ready().is_empty(),
            SourceKind::Timeout(t) => t.check(fd),
            SourceKind::Signal(s) => s.check(fd),
            SourceKind::Idle(i) => i.check(fd),
            SourceKind::Wakeup(efd) => {
                if !fd.ready().is_readable() {
                    return false;
                }
                match efd.read() {
                    Ok(_) => true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        fd.clear_ready(Ready::READABLE);
                        false
                    }
                    Err(_) => false,
                }
            }
        }
    }

    /// Runs the user callback. The return value decides whether the loop
    /// re-arms the source (`true`) or schedules its removal (`false`).
    pub(crate) fn dispatch(&self, fd: &SourceFd) -> bool {
        let mut callback = self.inner.callback.borrow_mut();
        match &mut *callback {
            Callback::Fd(f) => f(fd),
            Callback::Simple(f) => f(),
        }
    }
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        // Descriptors in the set belong to the caller and stay open; only
        // back-links are severed here. Variant-private descriptors close
        // with their owned fds.
        for sfd in self.fds.borrow().iter() {
            sfd.detach();
        }
    }
}

impl PartialEq for EventSource {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventSource {}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.kind {
            SourceKind::Fds => "fds",
            SourceKind::Timeout(_) => "timeout",
            SourceKind::Signal(_) => "signal",
            SourceKind::Idle(_) => "idle",
            SourceKind::Wakeup(_) => "wakeup",
        };
        f.debug_struct("EventSource")
            .field("kind", &kind)
            .field("priority", &self.priority())
            .field("fds", &self.inner.fds.borrow().len())
            .finish()
    }
}
